pub use duochat_tokio_transport::TokioWebSocketTransportFactory;
pub use duocore::net::{Transport, TransportEvent, TransportFactory};
