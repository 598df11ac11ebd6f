use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("unknown obligation status: {0}")]
    ObligationStatus(String),
    #[error("unknown invoice status: {0}")]
    InvoiceStatus(String),
    #[error("unknown billing frequency: {0}")]
    Frequency(String),
    #[error("unknown escalation kind: {0}")]
    Escalation(String),
}
