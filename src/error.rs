use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("storage error: {0}")]
    Store(#[from] rocksdb::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("consensus decoding error: {0}")]
    Consensus(#[from] bitcoin::consensus::encode::Error),

    #[error("key derivation error: {0}")]
    Derivation(#[from] bitcoin::bip32::Error),

    #[error("network io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("already connected")]
    AlreadyConnected,

    #[error("scanner {0:?} is already registered")]
    DuplicateScanner(String),

    #[error("version handshake timed out")]
    HandshakeTimeout,

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}
