pub mod access_log;
pub mod cgi;
pub mod config;
pub mod exception;
pub mod param;
pub mod request;
pub mod resolver;
pub mod response;
pub mod server;
pub mod transport;
pub mod util;

pub use config::Config;
pub use exception::Exception;
pub use param::{HttpRequestMethod, HttpStatus, HttpVersion};
pub use request::{RawRequest, Request};
pub use resolver::{Resolution, ResolvedOutcome, Resolver};
pub use response::Response;
