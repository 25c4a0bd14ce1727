mod fjall_bucket;
mod schema;

pub use fjall_bucket::FjallBucketStore;
pub use schema::Bootstrap;
