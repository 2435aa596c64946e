pub mod twelvedata;
pub mod twelvedata_ws;

pub use twelvedata::TwelveDataClient;
pub use twelvedata_ws::TwelveDataWs;
