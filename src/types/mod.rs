pub mod block;
pub mod primitives;
pub mod transaction;
pub mod transaction_pool;

pub use block::{Block, BlockHeader};
pub use primitives::{Address, H256};
pub use transaction::Transaction;
pub use transaction_pool::TransactionPool;
