pub use crate::error::{Error, Result};
pub use crate::query::{Limit, Operator, Order, Query};
pub use crate::store::{Collection, Document, Item, Store};
