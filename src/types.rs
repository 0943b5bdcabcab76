pub use ::mime::Mime;
pub use rustls::Certificate;
pub use uriparse::URIReference;

mod meta;
pub use self::meta::Meta;

mod request;
pub use request::Request;

mod status;
pub use status::{Status, StatusCategory};

mod response;
pub use response::Response;

mod body;
pub use body::Body;
