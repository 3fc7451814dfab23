pub mod compression;
pub mod local;
pub mod probe;
pub mod ssh;

pub use compression::Compression;
pub use local::LocalEndpoint;
pub use probe::Tools;
pub use ssh::{SshConfig, SshEndpoint};
