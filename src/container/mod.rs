pub mod arena;
pub mod hash_function;
pub mod hash_table;
pub mod sbitmap;
