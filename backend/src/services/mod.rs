pub mod classifier;
pub mod elasticsearch_service;
pub mod ingest;
pub mod ratelimit;
pub mod scraper;
