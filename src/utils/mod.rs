pub mod http;
pub mod logging;
pub mod text;
pub mod timeout;
pub mod timing;
