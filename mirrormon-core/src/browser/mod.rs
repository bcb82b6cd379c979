mod error;
mod interception;
mod screenshot;
mod session;
mod stealth;

pub use error::{BrowserError, BrowserResult};
pub use interception::{InterceptionPolicy, RequestDecision};
pub use session::{BrowserSessionManager, HttpSessionCleanup, SessionCleanup};
pub use stealth::StealthProfile;
