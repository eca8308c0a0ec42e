pub mod baas;
pub mod ledger;

pub use baas::{BaasError, BaasGateway, HttpBaasGateway};
pub use ledger::{InMemoryLedger, LedgerError, LedgerOp, LedgerStore, PgLedger, TransferEntry};
