#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("no session exists for the given key")]
    UnknownSession,
    #[error(transparent)]
    Session(#[from] ax25::SessionError),
    #[error(transparent)]
    Transfer(#[from] dgp::TransferError),
    #[error("address error: {0}")]
    Address(#[from] ax25::AddressError),
}
