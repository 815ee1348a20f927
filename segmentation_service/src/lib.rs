mod codec;
mod error;
mod inference_service;
mod mask;
mod model_service;
mod ort_service;
mod palette;
mod pipeline;
mod preprocess;
mod response;
mod routes;
mod server;
mod stats;

#[cfg(test)]
mod test_utils;

pub mod config;

pub use server::start_server;
