pub mod clock;
pub mod endpoints;
pub mod error;
pub mod pacing;
pub mod retry;
pub mod session;
pub mod signing;
pub mod transport;
pub mod walker;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use clock::{Clock, SystemClock};
pub use error::{FetchError, Result};
pub use pacing::{Pace, PacingGovernor, PacingProfile, PacingState};
pub use retry::{Backoff, Failure, FailureClass, RetryPolicy};
pub use session::{
    classify_reqwest, load_cookies, HttpSession, RawResponse, Session, SessionPort, TransportError,
};
pub use signing::{CommandSigner, SigningPort, SIGNATURE_PARAM};
pub use transport::RetryingTransport;
pub use walker::{FollowingEntry, FollowingWalk, PostWalk};
