//! Two-phase partition-and-reduce aggregation.
//!
//! ```text
//! <prefix><n>.csv.gz ──[Sharder]──▶ bucket_<id>.csv ──[Reducer]──▶ output_<n>.csv
//!   (records)                        (domain,ts)                   (domain,first,last)
//! ```
//!
//! Both passes must use the same bucket count.

mod reduce;
mod shard;

pub use reduce::{
    BucketTable, OUTPUT_FILE_PREFIX, ReduceConfig, ReduceStats, Reducer, existing_outputs,
    reduce_bucket,
};
pub use shard::{BucketPool, ShardConfig, ShardStats, Sharder};
