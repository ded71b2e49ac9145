#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HarvestStats {
    pub users_harvested: u32,
    pub users_failed: u32,
    pub users_skipped: u32,
    pub posts_seen: u32,
    pub posts_refetched: u32,
    pub posts_inserted: u32,
    pub posts_changed: u32,
    pub media_written: u32,
    pub media_skipped: u32,
    pub visits_main: u64,
    pub visits_alt: u64,
}

impl std::fmt::Display for HarvestStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n=== Harvest Complete ===")?;
        writeln!(f, "Users harvested: {}", self.users_harvested)?;
        writeln!(f, "Users failed:    {}", self.users_failed)?;
        writeln!(f, "Users skipped:   {}", self.users_skipped)?;
        writeln!(f, "Posts seen:      {}", self.posts_seen)?;
        writeln!(f, "Posts refetched: {}", self.posts_refetched)?;
        writeln!(f, "Posts new:       {}", self.posts_inserted)?;
        writeln!(f, "Posts changed:   {}", self.posts_changed)?;
        writeln!(f, "Media written:   {}", self.media_written)?;
        writeln!(f, "Media skipped:   {}", self.media_skipped)?;
        writeln!(f, "\nSession visits:")?;
        writeln!(f, "  main: {}", self.visits_main)?;
        write!(f, "  alt:  {}", self.visits_alt)
    }
}
