// Optimistic transactions over a replicated cache
//
// Keys are enlisted with a validator when first touched; at commit the
// validator drops every key whose lease did not move and rejects the
// transaction if anything is left.

pub mod transaction;
pub mod validator;

pub use transaction::OptimisticTransaction;
pub use validator::{ConflictSets, LeaseValidator, TransactionValidator, TransactionView};
