pub use duochat_ureq_http_client::UreqHttpClient;
pub use duocore::net::{HttpClient, HttpRequest, HttpResponse};
