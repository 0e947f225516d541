//! HTTP dispatch over reqwest.

pub mod dispatcher;

pub use dispatcher::ReqwestDispatcher;
