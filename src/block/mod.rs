pub mod bio;
pub mod request;
pub mod tag;
pub mod tag_set;
