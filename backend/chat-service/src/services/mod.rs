pub mod afc_verdicts;
pub mod client_chat;
pub mod event_stream;
pub mod manager_chat;
pub mod manager_load;
pub mod manager_pool;
pub mod manager_scheduler;
pub mod msg_producer;
