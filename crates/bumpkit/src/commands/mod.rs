//! Command implementations

pub mod audit;

pub mod bump;

pub mod doctor;

pub mod info;

pub mod purge;

pub mod rollback;
