pub mod listing;
pub mod middleware;
pub mod range;
pub mod routes;

// Re-export public types and functions
pub use listing::{FileEntry, FilesResponse, format_file_size};
pub use middleware::{TOKEN_HEADER, log_request_errors, require_token, security_headers};
pub use routes::{download_file, download_root, legacy_download, list_files, list_root, router};
