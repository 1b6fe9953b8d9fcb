#![warn(clippy::unwrap_used)]

pub mod checkout;
pub mod preload;
pub mod reconciliation;
pub mod reservation;

pub use checkout::FlashSaleCheckout;
pub use preload::CounterPreloader;
pub use reconciliation::{ReconciliationReport, StockReconciliationJob};
pub use reservation::{OrderReservation, Reservation, StockReservationService};
