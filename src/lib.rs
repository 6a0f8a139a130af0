pub mod error;
pub mod shutdown;
pub mod storage;
pub mod sync;
pub mod wallet;

pub use error::Error;
