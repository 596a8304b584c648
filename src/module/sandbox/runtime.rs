//! Wasm sandbox runtime
//!
//! Each run gets its own `Store`; stores share only the `Engine`. The only
//! import a module may declare is the syscall channel:
//!
//! ```text
//! (import "void" "syscall" (func (param i32 i32 i32 i32) (result i32)))
//! ;; req_ptr, req_len, resp_ptr, resp_cap -> response length
//! ```
//!
//! The request is a newline-delimited batch (see `ipc::protocol`). When the
//! response does not fit in `resp_cap`, the call returns the negated required
//! length and holds the response; calling again with `req_len == 0` collects it.
//!
//! Execution is bounded three ways: linear memory through a resource limiter
//! (growth past the ceiling traps, the initial allocation included), guest cpu
//! time and wall time through epoch checkpoints. A ticker bumps the engine
//! epoch every checkpoint interval and the deadline callback checks the
//! cancellation token and the cpu budget. Syscalls check both on entry and on
//! return, and an in-flight syscall batch is abandoned when the run is cancelled.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wasmtime::{
    Caller, Config, Engine, Extern, Func, Linker, Memory, Module, ResourceLimiter, Store,
    StoreLimits, StoreLimitsBuilder, Trap, UpdateDeadline, Val, ValType,
};

use crate::config::{ExecConfig, WASM_PAGE_BYTES};
use crate::module::api::gateway::{GatewaySession, SyscallGateway};
use crate::module::security::permissions::CapabilityGrant;
use crate::module::traits::{
    EntrySignature, ExecError, ResourceKind, ResourceLimits, ResourceUsage, TypedValue, ValueType,
};

/// Import module name of the syscall channel
pub const SYSCALL_MODULE: &str = "void";
/// Import name of the syscall channel
pub const SYSCALL_NAME: &str = "syscall";

/// Everything needed to execute one admitted run
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub run_id: String,
    pub principal: String,
    pub module_bytes: Arc<Vec<u8>>,
    pub entry: EntrySignature,
    pub args: Vec<TypedValue>,
    pub limits: ResourceLimits,
    pub grant: CapabilityGrant,
}

/// Result of a run plus the usage observed up to its end
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub outcome: Result<Vec<TypedValue>, ExecError>,
    pub usage: ResourceUsage,
}

struct HostState {
    session: GatewaySession,
    gateway: Arc<SyscallGateway>,
    rt: Handle,
    cancel: CancellationToken,
    store_limits: StoreLimits,
    memory_ceiling: usize,
    started: Instant,
    gateway_time: Duration,
    cpu_budget: Duration,
    memory: Option<Memory>,
    pending_response: Option<Vec<u8>>,
    host_error: Option<ExecError>,
    usage_tx: Option<watch::Sender<ResourceUsage>>,
}

impl HostState {
    fn cpu_used(&self) -> Duration {
        self.started.elapsed().saturating_sub(self.gateway_time)
    }

    fn snapshot(&self, memory_pages: u32) -> ResourceUsage {
        let mut usage = self.session.usage.clone();
        usage.cpu_ms = self.cpu_used().as_millis() as u64;
        usage.memory_pages = usage.memory_pages.max(memory_pages);
        usage
    }

    /// Checkpoint: publish usage, then enforce cancellation and the cpu budget
    fn checkpoint(&mut self, memory_pages: u32) -> anyhow::Result<()> {
        let usage = self.snapshot(memory_pages);
        self.session.usage.memory_pages = usage.memory_pages;
        if let Some(ref tx) = self.usage_tx {
            tx.send_replace(usage);
        }
        if self.cancel.is_cancelled() {
            self.host_error = Some(ExecError::Timeout);
            return Err(anyhow::anyhow!("run cancelled at checkpoint"));
        }
        if self.cpu_used() > self.cpu_budget {
            self.host_error = Some(ExecError::ResourceExceeded(ResourceKind::Cpu));
            return Err(anyhow::anyhow!("cpu budget exhausted"));
        }
        Ok(())
    }
}

/// Memory and table growth go through the store limits; a refused memory
/// growth is recorded as the run's error before the trap unwinds.
impl ResourceLimiter for HostState {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> anyhow::Result<bool> {
        if desired > self.memory_ceiling {
            debug!(
                "Refusing memory growth to {} bytes (ceiling {})",
                desired, self.memory_ceiling
            );
            self.host_error = Some(ExecError::ResourceExceeded(ResourceKind::Memory));
        }
        self.store_limits.memory_growing(current, desired, maximum)
    }

    fn memory_grow_failed(&mut self, error: anyhow::Error) -> anyhow::Result<()> {
        self.store_limits.memory_grow_failed(error)
    }

    fn table_growing(
        &mut self,
        current: u32,
        desired: u32,
        maximum: Option<u32>,
    ) -> anyhow::Result<bool> {
        self.store_limits.table_growing(current, desired, maximum)
    }

    fn instances(&self) -> usize {
        self.store_limits.instances()
    }

    fn tables(&self) -> usize {
        self.store_limits.tables()
    }

    fn memories(&self) -> usize {
        self.store_limits.memories()
    }
}

/// Executes admitted runs in isolated wasm stores
pub struct SandboxRuntime {
    engine: Engine,
    gateway: Arc<SyscallGateway>,
    checkpoint_interval: Duration,
}

impl SandboxRuntime {
    pub fn new(config: &ExecConfig, gateway: Arc<SyscallGateway>) -> Result<Self, ExecError> {
        let mut wasm_config = Config::new();
        wasm_config.epoch_interruption(true);
        wasm_config.wasm_threads(false);
        wasm_config.wasm_multi_memory(false);
        wasm_config.wasm_memory64(false);
        let engine = Engine::new(&wasm_config)
            .map_err(|e| ExecError::InternalError(format!("engine init failed: {e}")))?;
        Ok(Self {
            engine,
            gateway,
            checkpoint_interval: Duration::from_millis(config.limits.checkpoint_interval_ms.max(1)),
        })
    }

    /// Execute a plan to completion, timeout or fault.
    ///
    /// `cancel` is cancelled by the wall-clock watchdog; callers may cancel it
    /// too. Usage snapshots are published to `usage_tx` at every checkpoint.
    pub async fn execute(
        &self,
        plan: ExecutionPlan,
        cancel: CancellationToken,
        usage_tx: Option<watch::Sender<ResourceUsage>>,
    ) -> ExecutionReport {
        let done = CancellationToken::new();
        let wall = Duration::from_millis(plan.limits.wall_ms);

        let watchdog = {
            let cancel = cancel.clone();
            let done = done.clone();
            let run_id = plan.run_id.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = tokio::time::sleep(wall) => {
                        debug!("Run {} reached its wall budget", run_id);
                        cancel.cancel();
                    }
                    _ = done.cancelled() => {}
                }
            })
        };

        let ticker = {
            let engine = self.engine.clone();
            let done = done.clone();
            let period = self.checkpoint_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        _ = interval.tick() => engine.increment_epoch(),
                        _ = done.cancelled() => break,
                    }
                }
            })
        };

        let engine = self.engine.clone();
        let gateway = Arc::clone(&self.gateway);
        let rt = Handle::current();
        let run_id = plan.run_id.clone();
        let joined = tokio::task::spawn_blocking(move || {
            run_blocking(&engine, gateway, rt, plan, cancel, usage_tx)
        })
        .await;

        done.cancel();
        let _ = watchdog.await;
        let _ = ticker.await;

        match joined {
            Ok(report) => report,
            Err(e) => {
                warn!("Run {} worker failed: {}", run_id, e);
                ExecutionReport {
                    outcome: Err(ExecError::InternalError(format!("worker failed: {e}"))),
                    usage: ResourceUsage::default(),
                }
            }
        }
    }
}

fn run_blocking(
    engine: &Engine,
    gateway: Arc<SyscallGateway>,
    rt: Handle,
    plan: ExecutionPlan,
    cancel: CancellationToken,
    usage_tx: Option<watch::Sender<ResourceUsage>>,
) -> ExecutionReport {
    let memory_bytes = (u64::from(plan.limits.memory_pages) * WASM_PAGE_BYTES) as usize;
    let store_limits = StoreLimitsBuilder::new()
        .memory_size(memory_bytes)
        .instances(1)
        .memories(1)
        .trap_on_grow_failure(true)
        .build();
    let started = Instant::now();
    let session = GatewaySession::new(plan.run_id.clone(), plan.principal.clone(), plan.grant.clone())
        .with_deadline(cancel.clone(), started + Duration::from_millis(plan.limits.wall_ms));
    let state = HostState {
        session,
        gateway,
        rt,
        cancel,
        store_limits,
        memory_ceiling: memory_bytes,
        started,
        gateway_time: Duration::ZERO,
        cpu_budget: Duration::from_millis(plan.limits.cpu_ms),
        memory: None,
        pending_response: None,
        host_error: None,
        usage_tx,
    };
    let mut store = Store::new(engine, state);
    store.limiter(|state| state);
    store.set_epoch_deadline(1);
    store.epoch_deadline_callback(|mut ctx| {
        let memory = ctx.data().memory;
        let pages = memory.map(|m| m.size(&ctx) as u32).unwrap_or(0);
        ctx.data_mut().checkpoint(pages)?;
        Ok(UpdateDeadline::Continue(1))
    });

    let outcome = instantiate_and_call(engine, &mut store, &plan);

    let memory = store.data().memory;
    let pages = memory.map(|m| m.size(&store) as u32).unwrap_or(0);
    let usage = store.data().snapshot(pages);
    if let Some(ref tx) = store.data().usage_tx {
        tx.send_replace(usage.clone());
    }

    match outcome {
        Ok(ref values) => info!("Run {} returned {:?}", plan.run_id, values),
        Err(ref e) => info!("Run {} ended: {}", plan.run_id, e),
    }
    ExecutionReport { outcome, usage }
}

fn instantiate_and_call(
    engine: &Engine,
    store: &mut Store<HostState>,
    plan: &ExecutionPlan,
) -> Result<Vec<TypedValue>, ExecError> {
    let module = Module::new(engine, plan.module_bytes.as_slice())
        .map_err(|e| ExecError::RuntimeFault(format!("invalid module: {e}")))?;

    for import in module.imports() {
        if import.module() != SYSCALL_MODULE || import.name() != SYSCALL_NAME {
            return Err(ExecError::RuntimeFault(format!(
                "unsupported import {}.{}",
                import.module(),
                import.name()
            )));
        }
    }

    let mut linker = Linker::<HostState>::new(engine);
    define_syscall(&mut linker)?;

    let instance = linker
        .instantiate(&mut *store, &module)
        .map_err(|e| map_trap(store, e))?;
    let memory = instance.get_memory(&mut *store, "memory");
    store.data_mut().memory = memory;

    let func = instance
        .get_func(&mut *store, &plan.entry.name)
        .ok_or_else(|| ExecError::RuntimeFault(format!("entry '{}' is not exported", plan.entry.name)))?;
    check_entry_type(&func, &*store, &plan.entry)?;
    plan.entry.check_args(&plan.args).map_err(ExecError::RuntimeFault)?;

    let params: Vec<Val> = plan.args.iter().map(to_val).collect();
    let mut results: Vec<Val> = plan.entry.results.iter().map(zero_val).collect();
    func.call(&mut *store, &params, &mut results)
        .map_err(|e| map_trap(store, e))?;

    results.iter().map(from_val).collect()
}

fn define_syscall(linker: &mut Linker<HostState>) -> Result<(), ExecError> {
    linker
        .func_wrap(
            SYSCALL_MODULE,
            SYSCALL_NAME,
            |mut caller: Caller<'_, HostState>,
             req_ptr: i32,
             req_len: i32,
             out_ptr: i32,
             out_cap: i32|
             -> anyhow::Result<i32> {
                let memory = match caller.get_export("memory") {
                    Some(Extern::Memory(memory)) => memory,
                    _ => return Err(host_fault(&mut caller, "module exports no memory")),
                };
                let pages = memory.size(&caller) as u32;
                caller.data_mut().checkpoint(pages)?;

                let response = if req_len == 0 && caller.data().pending_response.is_some() {
                    caller.data_mut().pending_response.take().unwrap_or_default()
                } else {
                    let request = read_guest(&mut caller, memory, req_ptr, req_len)?;
                    let started = Instant::now();
                    let state = caller.data_mut();
                    let gateway = Arc::clone(&state.gateway);
                    let cancel = state.cancel.clone();
                    let rt = state.rt.clone();
                    let response = rt.block_on(async {
                        tokio::select! {
                            response = gateway.handle_batch(&mut state.session, &request) => Some(response),
                            _ = cancel.cancelled() => None,
                        }
                    });
                    state.gateway_time += started.elapsed();
                    match response {
                        Some(response) => response,
                        None => {
                            state.host_error = Some(ExecError::Timeout);
                            return Err(anyhow::anyhow!("run cancelled during syscall"));
                        }
                    }
                };

                // the batch may have outlived the budgets
                let pages = memory.size(&caller) as u32;
                caller.data_mut().checkpoint(pages)?;

                if out_cap < 0 || response.len() > out_cap as usize {
                    let needed = response.len() as i32;
                    caller.data_mut().pending_response = Some(response);
                    return Ok(-needed);
                }
                write_guest(&mut caller, memory, out_ptr, &response)?;
                Ok(response.len() as i32)
            },
        )
        .map_err(|e| ExecError::InternalError(format!("linker setup failed: {e}")))?;
    Ok(())
}

fn host_fault(caller: &mut Caller<'_, HostState>, detail: &str) -> anyhow::Error {
    caller.data_mut().host_error = Some(ExecError::RuntimeFault(detail.to_string()));
    anyhow::anyhow!("{}", detail)
}

fn guest_range(caller: &mut Caller<'_, HostState>, memory: Memory, ptr: i32, len: i32) -> anyhow::Result<(usize, usize)> {
    if ptr < 0 || len < 0 {
        return Err(host_fault(caller, "negative syscall pointer or length"));
    }
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .ok_or_else(|| host_fault(caller, "syscall pointer overflow"))?;
    if end > memory.data_size(&*caller) {
        return Err(host_fault(caller, "out-of-bounds syscall buffer"));
    }
    Ok((start, end - start))
}

fn read_guest(caller: &mut Caller<'_, HostState>, memory: Memory, ptr: i32, len: i32) -> anyhow::Result<Vec<u8>> {
    let (start, len) = guest_range(caller, memory, ptr, len)?;
    let mut buf = vec![0u8; len];
    memory
        .read(&*caller, start, &mut buf)
        .map_err(|_| host_fault(caller, "out-of-bounds syscall buffer"))?;
    Ok(buf)
}

fn write_guest(caller: &mut Caller<'_, HostState>, memory: Memory, ptr: i32, data: &[u8]) -> anyhow::Result<()> {
    let (start, _) = guest_range(caller, memory, ptr, data.len() as i32)?;
    memory
        .write(&mut *caller, start, data)
        .map_err(|_| host_fault(caller, "out-of-bounds syscall buffer"))
}

fn map_trap(store: &Store<HostState>, err: anyhow::Error) -> ExecError {
    if let Some(host) = store.data().host_error.clone() {
        return host;
    }
    if let Some(trap) = err.downcast_ref::<Trap>() {
        return match trap {
            Trap::MemoryOutOfBounds => ExecError::RuntimeFault("out-of-bounds memory access".into()),
            Trap::UnreachableCodeReached => ExecError::RuntimeFault("unreachable instruction".into()),
            Trap::StackOverflow => ExecError::RuntimeFault("stack overflow".into()),
            Trap::Interrupt => ExecError::Timeout,
            other => ExecError::RuntimeFault(other.to_string()),
        };
    }
    ExecError::RuntimeFault(format!("{err:#}"))
}

fn type_matches(actual: &ValType, expected: ValueType) -> bool {
    matches!(
        (actual, expected),
        (ValType::I32, ValueType::I32)
            | (ValType::I64, ValueType::I64)
            | (ValType::F32, ValueType::F32)
            | (ValType::F64, ValueType::F64)
    )
}

fn check_entry_type(func: &Func, store: &Store<HostState>, entry: &EntrySignature) -> Result<(), ExecError> {
    let ty = func.ty(store);
    let params: Vec<ValType> = ty.params().collect();
    let results: Vec<ValType> = ty.results().collect();
    let ok = params.len() == entry.params.len()
        && results.len() == entry.results.len()
        && params.iter().zip(&entry.params).all(|(a, e)| type_matches(a, *e))
        && results.iter().zip(&entry.results).all(|(a, e)| type_matches(a, *e));
    if ok {
        Ok(())
    } else {
        Err(ExecError::RuntimeFault(format!(
            "entry '{}' does not match signature {}",
            entry.name, entry
        )))
    }
}

fn to_val(value: &TypedValue) -> Val {
    match *value {
        TypedValue::I32(v) => Val::I32(v),
        TypedValue::I64(v) => Val::I64(v),
        TypedValue::F32(v) => Val::F32(v.to_bits()),
        TypedValue::F64(v) => Val::F64(v.to_bits()),
    }
}

fn zero_val(ty: &ValueType) -> Val {
    match ty {
        ValueType::I32 => Val::I32(0),
        ValueType::I64 => Val::I64(0),
        ValueType::F32 => Val::F32(0),
        ValueType::F64 => Val::F64(0),
    }
}

fn from_val(value: &Val) -> Result<TypedValue, ExecError> {
    match value {
        Val::I32(v) => Ok(TypedValue::I32(*v)),
        Val::I64(v) => Ok(TypedValue::I64(*v)),
        Val::F32(bits) => Ok(TypedValue::F32(f32::from_bits(*bits))),
        Val::F64(bits) => Ok(TypedValue::F64(f64::from_bits(*bits))),
        _ => Err(ExecError::RuntimeFault("entry returned a non-scalar value".into())),
    }
}
