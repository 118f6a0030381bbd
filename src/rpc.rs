pub mod call;
pub mod data_getter;
pub mod service;
