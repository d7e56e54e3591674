pub mod channel;
pub mod dispatcher;
pub mod email;
pub mod live_activity;
pub mod push;
pub mod repository;
pub mod storage;
pub mod token_cache;
