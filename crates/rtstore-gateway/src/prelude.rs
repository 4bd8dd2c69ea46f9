pub use crate::adapter::NotifyingStore;
pub use crate::session::{handle_socket, Operation, WebSocketMessage};
pub use tracing::{debug, error, info, warn};
