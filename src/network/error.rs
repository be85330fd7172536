use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Transport error: {0}")]
    TransportError(#[from] std::io::Error),

    #[error("Timeout error")]
    TimeoutError,

    #[error("Peer {0} is unreachable")]
    Unreachable(String),

    #[error("Unknown peer: {0}")]
    UnknownPeer(String),

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Codec error: {0}")]
    CodecError(String),

    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),
}
