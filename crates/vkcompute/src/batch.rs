//! One-shot batch execution of a two-slot kernel.
//!
//! [`BatchRunner`] owns everything a kernel run needs besides storage: the
//! descriptor layout, pool and set, the pipeline and the dispatcher. Each
//! [`BatchRunner::run`] provisions storage for one strategy, runs the kernel
//! once and releases the storage again.

use std::time::Duration;

use bytemuck::Pod;
use tracing::{info, info_span};

use crate::config::ComputeConfig;
use crate::descriptor::{DescriptorLayout, DescriptorPool, DescriptorSet};
use crate::device::DeviceContext;
use crate::dispatch::{DispatchReport, DispatchState, Dispatcher};
use crate::error::{ComputeError, Result};
use crate::kernels::SLOT_COUNT;
use crate::memory::ResourceAllocator;
use crate::pipeline::ComputePipeline;
use crate::strategy::{AllocationStrategy, KernelStorage};

/// Output of one [`BatchRunner::run`].
#[derive(Debug, Clone, PartialEq)]
pub struct BatchOutput<T> {
    pub strategy: AllocationStrategy,
    pub values: Vec<T>,
    pub report: DispatchReport,
}

/// Runs a kernel reading slot 0 and writing slot 1 over host-provided data.
pub struct BatchRunner<'ctx> {
    ctx: &'ctx DeviceContext,
    allocator: ResourceAllocator<'ctx>,
    dispatcher: Option<Dispatcher<'ctx>>,
    pipeline: Option<ComputePipeline>,
    set: Option<DescriptorSet>,
    pool: Option<DescriptorPool>,
    layout: Option<DescriptorLayout>,
}

impl<'ctx> BatchRunner<'ctx> {
    /// Build with the pool capacity and fence timeout from `config`.
    pub fn with_config(
        ctx: &'ctx DeviceContext,
        config: &ComputeConfig,
        bytecode: &[u8],
        entry_point: &str,
    ) -> Result<Self> {
        Self::new(
            ctx,
            bytecode,
            entry_point,
            config.descriptor_pool_capacity,
            config.fence_timeout(),
        )
    }

    pub fn new(
        ctx: &'ctx DeviceContext,
        bytecode: &[u8],
        entry_point: &str,
        pool_capacity: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let mut runner = Self {
            ctx,
            allocator: ResourceAllocator::new(ctx),
            dispatcher: None,
            pipeline: None,
            set: None,
            pool: None,
            layout: None,
        };
        // Anything created before an early return is destroyed by `Drop`.
        let layout = runner.layout.insert(DescriptorLayout::create(ctx, SLOT_COUNT)?);
        let pool = runner.pool.insert(DescriptorPool::create(ctx, pool_capacity, layout)?);
        runner.set = Some(pool.allocate_set(ctx, layout)?);
        runner.pipeline = Some(ComputePipeline::build(ctx, bytecode, entry_point, layout)?);
        runner.dispatcher = Some(Dispatcher::new(ctx, timeout)?);
        Ok(runner)
    }

    fn parts(
        &mut self,
    ) -> Result<(&mut Dispatcher<'ctx>, &ComputePipeline, &mut DescriptorSet)> {
        match (&mut self.dispatcher, &self.pipeline, &mut self.set) {
            (Some(d), Some(p), Some(s)) => Ok((d, p, s)),
            _ => Err(ComputeError::AlreadyReleased("batch runner")),
        }
    }

    /// Workgroup size of the loaded kernel along x.
    pub fn workgroup_size(&self) -> u32 {
        self.pipeline.as_ref().map_or(1, |p| p.workgroup_size()[0])
    }

    pub fn dispatcher_state(&self) -> Option<DispatchState> {
        self.dispatcher.as_ref().map(Dispatcher::state)
    }

    /// Run the kernel once over `input` using `strategy` for storage.
    ///
    /// Buffers are padded to a whole number of workgroups so trailing
    /// invocations stay in bounds; only `input.len()` values are returned.
    pub fn run<T: Pod>(
        &mut self,
        strategy: AllocationStrategy,
        input: &[T],
    ) -> Result<BatchOutput<T>> {
        if input.is_empty() {
            return Err(ComputeError::invalid("input must not be empty"));
        }
        let _span = info_span!("batch", %strategy, elements = input.len()).entered();

        let workgroup_size = self.workgroup_size() as usize;
        let buffer_size = input
            .len()
            .div_ceil(workgroup_size)
            .checked_mul(workgroup_size)
            .and_then(|padded| padded.checked_mul(std::mem::size_of::<T>()))
            .ok_or_else(|| ComputeError::invalid("input too large"))?;

        let mut storage = KernelStorage::provision(&self.allocator, strategy, buffer_size as u64)?;
        let result = self.run_on(&mut storage, input);
        let released = storage.release(&self.allocator);

        let (values, report) = result?;
        released?;
        info!(elapsed_us = report.elapsed.as_micros() as u64, "batch finished");
        Ok(BatchOutput { strategy, values, report })
    }

    fn run_on<T: Pod>(
        &mut self,
        storage: &mut KernelStorage,
        input: &[T],
    ) -> Result<(Vec<T>, DispatchReport)> {
        let ctx = self.ctx;
        let (dispatcher, pipeline, set) = self.parts()?;
        storage.write_input(input)?;
        storage.bind_into(ctx, set)?;
        let report = dispatcher.dispatch(pipeline, set, input.len() as u64)?;
        let values = storage.read_output(input.len())?;
        Ok((values, report))
    }
}

impl Drop for BatchRunner<'_> {
    fn drop(&mut self) {
        // Dispatcher first: its command pool may reference the pipeline.
        self.dispatcher.take();
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.destroy(self.ctx);
        }
        self.set.take();
        if let Some(pool) = self.pool.take() {
            pool.destroy(self.ctx);
        }
        if let Some(layout) = self.layout.take() {
            layout.destroy(self.ctx);
        }
    }
}
