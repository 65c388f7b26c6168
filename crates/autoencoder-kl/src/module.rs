//! Training-loop contract.
//!
//! The outer driver owns epochs, data and devices. It calls
//! [`TrainingModule::training_step`] once per phase and steps the matching
//! optimizer itself, or hands both optimizers to
//! [`AutoencoderModule::train_batch`] for the fixed generator-then-discriminator
//! alternation.

use candle_core::{Device, Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use tracing::{debug, info};

use crate::autoencoder::{get_input, AutoencoderKl};
use crate::checkpoint::{restore, RestoreReport, Snapshot};
use crate::config::{AutoencoderConfig, OptimConfig};
use crate::error::AutoencoderResult;
use crate::loss::{LossCoordinator, LossInputs, LossLog, LossPhase, Split};

/// Hooks an external training loop drives.
pub trait TrainingModule {
    type Optimizers;

    /// Loss for one optimizer phase on a channels-last batch.
    fn training_step(&mut self, batch: &Tensor, phase_index: usize) -> AutoencoderResult<StepOutput>;

    /// Diagnostics for both phases. Never updates parameters.
    fn validation_step(&mut self, batch: &Tensor) -> AutoencoderResult<LossLog>;

    fn configure_optimizers(&self) -> AutoencoderResult<Self::Optimizers>;
}

/// Loss to backpropagate plus its detached diagnostics.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub loss: Tensor,
    pub log: LossLog,
}

/// One Adam instance per disjoint parameter group.
pub struct OptimizerPair {
    /// Encoder, decoder and both projection convolutions.
    pub generator: AdamW,
    /// Discriminator weights (running statistics excluded).
    pub discriminator: AdamW,
}

/// Outcome of [`AutoencoderModule::train_batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    /// Step the losses were computed at, before the increment.
    pub global_step: usize,
    pub ae_loss: f32,
    pub disc_loss: f32,
    pub log: LossLog,
}

/// Autoencoder plus its loss, learning rate and step counter.
///
/// Clones share parameter storage with the original: training either one
/// updates both.
#[derive(Debug, Clone)]
pub struct AutoencoderModule {
    model: AutoencoderKl,
    loss: LossCoordinator,
    optim: OptimConfig,
    global_step: usize,
    training: bool,
}

impl AutoencoderModule {
    /// Validate `config`, build the networks and restore `config.checkpoint`
    /// if present.
    pub fn new(config: &AutoencoderConfig, device: &Device) -> AutoencoderResult<Self> {
        config.validate()?;
        let model = AutoencoderKl::new(config, device)?;
        let loss = LossCoordinator::new(&config.loss, device)?;
        let module = Self {
            model,
            loss,
            optim: config.optim.clone(),
            global_step: 0,
            training: true,
        };
        if let Some(ckpt) = &config.checkpoint {
            module.init_from_ckpt(&ckpt.path, &ckpt.ignore_keys)?;
        }
        Ok(module)
    }

    pub fn model(&self) -> &AutoencoderKl {
        &self.model
    }

    pub fn loss(&self) -> &LossCoordinator {
        &self.loss
    }

    pub fn learning_rate(&self) -> f64 {
        self.optim.learning_rate
    }

    /// Every checkpointed tensor: autoencoder parameters and buffers, then
    /// `loss.logvar` and `loss.discriminator.…`.
    pub fn named_parameters(&self) -> AutoencoderResult<Vec<(String, Var)>> {
        let mut params = self.model.named_parameters()?;
        params.extend(self.model.named_buffers());
        params.extend(
            self.loss
                .named_parameters()?
                .into_iter()
                .map(|(name, var)| (format!("loss.{name}"), var)),
        );
        Ok(params)
    }

    /// Restore over the combined parameter table.
    pub fn init_from_ckpt(
        &self,
        path: impl AsRef<std::path::Path>,
        ignore_keys: &[String],
    ) -> AutoencoderResult<RestoreReport> {
        let snapshot = Snapshot::load(path, self.model.device())?;
        restore(&snapshot, ignore_keys, &self.named_parameters()?)
    }

    /// Write every checkpointed tensor to `path`.
    pub fn save_checkpoint(&self, path: impl AsRef<std::path::Path>) -> AutoencoderResult<()> {
        let params: Vec<(String, Tensor)> = self
            .named_parameters()?
            .into_iter()
            .map(|(name, var)| (name, var.as_tensor().clone()))
            .collect();
        Snapshot::save(path, &params)
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }

    pub fn set_global_step(&mut self, step: usize) {
        self.global_step = step;
    }

    pub fn train(&mut self) {
        self.training = true;
        self.loss.train();
    }

    pub fn eval(&mut self) {
        self.training = false;
        self.loss.eval();
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Posterior mode, channels-last, flattened to `(B, h * w * embed_dim)`.
    pub fn predict(&self, batch: &Tensor) -> AutoencoderResult<Tensor> {
        let x = get_input(batch)?;
        let posterior = self.model.encode(&x)?;
        let z = posterior.mode().permute((0, 2, 3, 1))?;
        Ok(z.flatten_from(1)?)
    }

    /// Fresh forward, generator step, then discriminator step on the same
    /// reconstruction. Advances `global_step` by one.
    pub fn train_batch(
        &mut self,
        batch: &Tensor,
        optimizers: &mut OptimizerPair,
    ) -> AutoencoderResult<StepReport> {
        let step = self.global_step;
        let x = get_input(batch)?;
        let (reconstructions, posterior) = self.model.forward(&x, true)?;
        let inputs = LossInputs::new(&x, &reconstructions, &posterior, step)
            .with_last_layer(self.model.get_last_layer())
            .with_split(Split::Train);

        let (ae_loss, mut log) = self.loss.forward(&inputs, LossPhase::Generator)?;
        optimizers.generator.backward_step(&ae_loss)?;

        let (disc_loss, disc_log) = self.loss.forward(&inputs, LossPhase::Discriminator)?;
        optimizers.discriminator.backward_step(&disc_loss)?;
        log.merge(disc_log);

        let ae_loss = ae_loss.to_scalar::<f32>()?;
        let disc_loss = disc_loss.to_scalar::<f32>()?;
        log.insert("aeloss", ae_loss);
        log.insert("discloss", disc_loss);
        self.global_step += 1;

        debug!(
            target: "autoencoder_kl::module",
            global_step = step,
            ae_loss,
            disc_loss,
            "Trained batch"
        );
        Ok(StepReport {
            global_step: step,
            ae_loss,
            disc_loss,
            log,
        })
    }

    fn validation_logs(&self, batch: &Tensor) -> AutoencoderResult<LossLog> {
        let x = get_input(batch)?;
        let (reconstructions, posterior) = self.model.forward(&x, true)?;
        let reconstructions = reconstructions.detach();
        let posterior = posterior.detach();
        let inputs = LossInputs::new(&x, &reconstructions, &posterior, self.global_step)
            .with_last_layer(self.model.get_last_layer())
            .with_split(Split::Val);

        let (_, mut log) = self.loss.forward(&inputs, LossPhase::Generator)?;
        let (_, disc_log) = self.loss.forward(&inputs, LossPhase::Discriminator)?;
        log.merge(disc_log);
        Ok(log)
    }
}

impl TrainingModule for AutoencoderModule {
    type Optimizers = OptimizerPair;

    fn training_step(&mut self, batch: &Tensor, phase_index: usize) -> AutoencoderResult<StepOutput> {
        let phase = LossPhase::try_from(phase_index)?;
        let x = get_input(batch)?;
        let (reconstructions, posterior) = self.model.forward(&x, true)?;
        let inputs = LossInputs::new(&x, &reconstructions, &posterior, self.global_step)
            .with_last_layer(self.model.get_last_layer())
            .with_split(Split::Train);

        let (loss, mut log) = self.loss.forward(&inputs, phase)?;
        let key = match phase {
            LossPhase::Generator => "aeloss",
            LossPhase::Discriminator => "discloss",
        };
        log.insert_tensor(key, &loss)?;
        Ok(StepOutput { loss, log })
    }

    fn validation_step(&mut self, batch: &Tensor) -> AutoencoderResult<LossLog> {
        let was_training = self.training;
        self.eval();
        let result = self.validation_logs(batch);
        if was_training {
            self.train();
        }
        result
    }

    /// Adam (AdamW with zero weight decay) for each group, sharing the
    /// configured learning rate and betas.
    fn configure_optimizers(&self) -> AutoencoderResult<OptimizerPair> {
        let params = ParamsAdamW {
            lr: self.optim.learning_rate,
            beta1: self.optim.beta1,
            beta2: self.optim.beta2,
            eps: self.optim.eps,
            weight_decay: 0.0,
        };
        let generator_vars = self.model.trainable_vars();
        let discriminator_vars = self.loss.discriminator().trainable_vars()?;
        info!(
            target: "autoencoder_kl::module",
            lr = params.lr,
            beta1 = params.beta1,
            beta2 = params.beta2,
            generator_tensors = generator_vars.len(),
            discriminator_tensors = discriminator_vars.len(),
            "Configured optimizers"
        );
        Ok(OptimizerPair {
            generator: AdamW::new(generator_vars, params.clone())?,
            discriminator: AdamW::new(discriminator_vars, params)?,
        })
    }
}
