//! Errors reported by the reservation layer.

use thiserror::Error;

/// Failure of a reservation or of an access to reserved memory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageError {
    #[error("address space exhausted: cannot reserve {size:#x} bytes")]
    ReservationFailed { size: usize },
    #[error("invalid alignment {alignment:#x}")]
    InvalidAlignment { alignment: usize },
    #[error("range {addr:#x}+{len:#x} is not aligned to {alignment:#x}")]
    Misaligned {
        addr: usize,
        len: usize,
        alignment: usize,
    },
    #[error("address {addr:#x} is not inside any reservation")]
    Unmapped { addr: usize },
    #[error("address {addr:#x} is reserved but not committed")]
    NotCommitted { addr: usize },
    #[error("range {addr:#x}+{len:#x} crosses a reservation boundary")]
    OutOfRange { addr: usize, len: usize },
    #[error("no reservation starts at {base:#x} with size {size:#x}")]
    UnknownReservation { base: usize, size: usize },
}
