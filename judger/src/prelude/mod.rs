mod cancel_token;

pub use cancel_token::*;
pub use tokio_util::sync::CancellationToken;
