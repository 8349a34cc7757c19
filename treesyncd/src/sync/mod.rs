pub mod apply;
pub mod conflict;
pub mod digest;
pub mod history;
pub mod index;
pub mod local;
pub mod paths;
pub mod processor;
pub mod remote;
