mod candidates;
mod dispositions;
mod feeds;
mod schema;
mod types;

pub use schema::Database;
pub use types::{
    Candidate, DatabaseError, DiscardReason, Disposition, FeedRecord, ImportReport, Mutation,
    NewCandidate, StoreStats, Submission, UnknownReason,
};
