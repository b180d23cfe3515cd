pub mod conversion_log;
pub mod converter;
pub mod errors;
pub mod gz_stream;
pub mod preprocess;
pub mod readcounts;
pub mod reconcile;
pub mod reports;
pub mod sam;
pub mod score_table;
pub mod seqreader;
pub mod threadpool;
pub mod trimmer;
