pub mod dataset;
pub mod endpoint;
pub mod error;
pub mod pipeline;
pub mod process;
pub mod stream;
pub mod transfer;
pub mod types;
pub mod zfs;

pub use dataset::{Dataset, DestroyOptions, RenameOptions, RollbackOptions};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use pipeline::{Pipeline, ReceivePath, Stage, TransferFlags, TransferPlan};
pub use process::CommandOutput;
pub use transfer::{Transfer, TransferReport};
pub use types::*;
pub use zfs::{CreateOptions, Zfs};
