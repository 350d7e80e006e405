use topology::GpuUsageStatus;

/// Draws a utilization percentage for one pod on one GPU.
pub trait UtilizationSampler: Send + Sync {
    fn sample(&self, status: &GpuUsageStatus) -> u32;
}

/// Uniform draw from the pod's configured utilization range
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSampler;

impl UtilizationSampler for RandomSampler {
    fn sample(&self, status: &GpuUsageStatus) -> u32 {
        status.utilization.random(&mut rand::rng())
    }
}

impl<F> UtilizationSampler for F
where
    F: Fn(&GpuUsageStatus) -> u32 + Send + Sync,
{
    fn sample(&self, status: &GpuUsageStatus) -> u32 {
        self(status)
    }
}
