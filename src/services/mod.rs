//! Upload core: chunk storage, session bookkeeping, the upload state machine
//! and the cleanup sweeper.

pub mod chunk_store;
pub mod cleanup_service;
pub mod permanent_store;
pub mod session_registry;
pub mod session_repository;
pub mod tokens;
pub mod upload_service;
