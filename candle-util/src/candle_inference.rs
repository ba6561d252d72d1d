pub struct TrainConfig {
    pub learning_rate: f32,
    pub batch_size: usize,
    pub num_epochs: usize,
    pub kl_warmup_epochs: usize,
    pub classification_ratio: f32,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl TrainConfig {
    /// KL annealing weight `min(1, epoch / warmup)`
    pub fn kl_weight(&self, epoch: usize) -> f64 {
        if self.kl_warmup_epochs == 0 {
            1.
        } else {
            (epoch as f64 / self.kl_warmup_epochs as f64).min(1.)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kl_weight_ramps_up() {
        let mut config = TrainConfig {
            learning_rate: 1e-3,
            batch_size: 16,
            num_epochs: 10,
            kl_warmup_epochs: 4,
            classification_ratio: 50.,
            device: candle_core::Device::Cpu,
            verbose: false,
            show_progress: false,
        };
        assert_eq!(config.kl_weight(0), 0.);
        assert_eq!(config.kl_weight(2), 0.5);
        assert_eq!(config.kl_weight(9), 1.);

        config.kl_warmup_epochs = 0;
        assert_eq!(config.kl_weight(0), 1.);
    }
}
