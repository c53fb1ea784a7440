pub mod context;
pub mod deeplink;
pub mod storage;

pub use context::{AuthState, Route, SessionContext, SignUpStatus, EMAIL_CONFIRMED_MESSAGE};
pub use deeplink::{parse_confirmation, ConfirmationLink};
pub use storage::{FileSessionStorage, MemorySessionStorage, SessionStorage};
