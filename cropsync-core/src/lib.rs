mod client;

pub use client::{
    ApiError, ApiErrorClass, ApplyOutcome, Mutation, RecordClient, RecordRequest, RemoteRecord,
};
