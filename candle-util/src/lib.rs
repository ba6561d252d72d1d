pub mod candle_aux_layers;
pub mod candle_classifier;
pub mod candle_data_loader;
pub mod candle_decoder_count;
pub mod candle_decoder_gaussian;
pub mod candle_encoder_gaussian;
pub mod candle_inference;
pub mod candle_label_broadcast;
pub mod candle_loss_functions;
pub mod candle_model_error;
pub mod candle_model_svaec;
pub mod candle_model_traits;
pub mod candle_model_vae;
pub mod candle_svaec_posterior;
pub mod candle_vae_inference;

pub use candle_core;
pub use candle_nn;
