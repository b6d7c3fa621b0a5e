//! Domain layer
//!
//! Core value types shared by every pipeline stage: marketplaces and origins,
//! sessions, fetch tasks, products and the import error taxonomy.
//! Nothing in here performs I/O.

pub mod errors;
pub mod marketplace;
pub mod product;
pub mod session;
pub mod task;

pub use errors::{ErrorKind, ImportError, ImportResult};
pub use marketplace::{Marketplace, Origin};
pub use product::{
    ImageRef, Price, ProductRecord, ProductType, RawProduct, RecordWarning, StockStatus, Variation,
};
pub use session::{Session, SessionStatus};
pub use task::{FetchTask, TaskId, TaskState, TransitionError};
