pub mod abi;
pub mod agent_client;
pub mod ethereum;
pub mod memory_store;
pub mod mock_agent;
pub mod mock_chain;
pub mod sled_store;
