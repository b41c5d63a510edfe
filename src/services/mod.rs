pub mod job_queue;
pub mod reconciler;
pub mod rendition_processor;
pub mod resize_worker;
pub mod storage_service;
pub mod upload_spool;
