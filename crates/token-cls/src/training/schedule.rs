/// Learning-rate source stepped once per optimizer update.
pub trait LrSchedule {
    /// LR for the optimizer step about to happen; advances the schedule.
    fn step(&mut self) -> f64;

    /// LR the next call to [`LrSchedule::step`] will return.
    fn current(&self) -> f64;
}

/// Fixed learning rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConstantLr(pub f64);

impl LrSchedule for ConstantLr {
    fn step(&mut self) -> f64 {
        self.0
    }

    fn current(&self) -> f64 {
        self.0
    }
}

/// Linear warmup from 0 to `base_lr`, then linear decay to 0 at `total_steps`.
///
/// The first step is taken at LR 0.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearWarmupDecay {
    pub base_lr: f64,
    pub warmup_steps: f64,
    pub total_steps: usize,
    step: usize,
}

impl LinearWarmupDecay {
    pub fn new(base_lr: f64, warmup_steps: f64, total_steps: usize) -> Self {
        Self { base_lr, warmup_steps, total_steps, step: 0 }
    }

    /// Warmup of 1.5 epochs, decay to zero at the end of the last epoch.
    pub fn for_run(base_lr: f64, steps_per_epoch: usize, epochs: usize) -> Self {
        Self::new(base_lr, steps_per_epoch as f64 * 1.5, steps_per_epoch * epochs)
    }

    /// Number of steps taken so far.
    pub fn steps_taken(&self) -> usize {
        self.step
    }

    /// Resume from a known optimizer step count.
    pub fn with_steps_taken(mut self, step: usize) -> Self {
        self.step = step;
        self
    }
}

/// LR at step `step` of a linear warmup/decay schedule.
pub fn linear_warmup_decay(base_lr: f64, warmup_steps: f64, total_steps: usize, step: usize) -> f64 {
    let s = step as f64;
    if s < warmup_steps {
        base_lr * s / warmup_steps.max(1.0)
    } else {
        let total = total_steps as f64;
        base_lr * ((total - s) / (total - warmup_steps).max(1.0)).max(0.0)
    }
}

impl LrSchedule for LinearWarmupDecay {
    fn step(&mut self) -> f64 {
        let lr = self.current();
        self.step += 1;
        lr
    }

    fn current(&self) -> f64 {
        linear_warmup_decay(self.base_lr, self.warmup_steps, self.total_steps, self.step)
    }
}
