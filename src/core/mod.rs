pub mod agent;
pub mod brain;
pub mod config;
pub mod conversation;
pub mod embedding;
pub mod lifecycle;
pub mod llm;
pub mod memory;
pub mod resolver;
pub mod scheduler;
pub mod terminal;
pub mod workflow;
