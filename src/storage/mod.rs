pub mod btree;
pub mod buffer_pool;
pub mod heap_file;
pub mod key;
pub mod page;
pub mod tablespace;
pub mod tuple;
