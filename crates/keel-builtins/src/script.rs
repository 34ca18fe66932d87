use crate::process::{MAX_STDERR, MAX_STDOUT};
use async_trait::async_trait;
use keel_core::{KeelError, KeelResult, Reason, ToolCall, ToolKind, ToolResult};
use keel_tools::{truncate_output, ExecLimits, Tool, ToolDescriptor};
use std::path::PathBuf;
use tracing::info;
use wasmtime::{Config, Engine, Linker, Module, Store, Trap};
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{I32Exit, WasiCtxBuilder};

const DEFAULT_FUEL: u64 = 500_000_000;
const PIPE_CAPACITY: usize = 1024 * 1024;

/// Embedded scripting tool: runs a WASI (preview 1) module under wasmtime.
///
/// The module gets `input` on stdin, no preopened directories, no sockets,
/// and a fuel budget that bounds its execution. Stdout is the output.
pub struct ScriptTool {
    descriptor: ToolDescriptor,
    engine: Engine,
    fuel: u64,
}

impl ScriptTool {
    /// Create the WASM engine shared by every script call.
    pub fn new() -> KeelResult<Self> {
        let mut config = Config::new();
        config.consume_fuel(true);
        let engine = Engine::new(&config)
            .map_err(|e| KeelError::Tool(format!("failed to create WASM engine: {e}")))?;
        Ok(Self {
            descriptor: ToolDescriptor::new(
                ToolKind::Script,
                "Run a sandboxed WebAssembly (WASI) module.",
                &["run"],
            ),
            engine,
            fuel: DEFAULT_FUEL,
        })
    }

    /// Instructions-worth of fuel granted per run.
    pub fn with_fuel(mut self, fuel: u64) -> Self {
        self.fuel = fuel;
        self
    }
}

enum RunOutcome {
    Exited { code: i32, stdout: String, stderr: String },
    OutOfFuel,
}

fn run_module(engine: &Engine, module: &Module, input: &str, fuel: u64) -> KeelResult<RunOutcome> {
    let mut linker = Linker::<WasiP1Ctx>::new(engine);
    preview1::add_to_linker_sync(&mut linker, |t| t)
        .map_err(|e| KeelError::Tool(format!("WASI linker error: {e}")))?;

    let stdout = MemoryOutputPipe::new(PIPE_CAPACITY);
    let stderr = MemoryOutputPipe::new(PIPE_CAPACITY);
    let wasi = WasiCtxBuilder::new()
        .stdin(MemoryInputPipe::new(input.as_bytes().to_vec()))
        .stdout(stdout.clone())
        .stderr(stderr.clone())
        .arg("script")
        .build_p1();

    let mut store = Store::new(engine, wasi);
    store
        .set_fuel(fuel)
        .map_err(|e| KeelError::Tool(format!("failed to set fuel: {e}")))?;

    let instance = linker
        .instantiate(&mut store, module)
        .map_err(|e| KeelError::Tool(format!("WASM instantiation error: {e}")))?;
    let start = instance
        .get_typed_func::<(), ()>(&mut store, "_start")
        .map_err(|e| KeelError::Tool(format!("module has no _start export: {e}")))?;

    let code = match start.call(&mut store, ()) {
        Ok(()) => 0,
        Err(e) => {
            if let Some(exit) = e.downcast_ref::<I32Exit>() {
                exit.0
            } else if e.downcast_ref::<Trap>() == Some(&Trap::OutOfFuel) {
                return Ok(RunOutcome::OutOfFuel);
            } else {
                return Ok(RunOutcome::Exited {
                    code: -1,
                    stdout: String::from_utf8_lossy(&stdout.contents()).into_owned(),
                    stderr: format!("trap: {e}"),
                });
            }
        }
    };

    Ok(RunOutcome::Exited {
        code,
        stdout: String::from_utf8_lossy(&stdout.contents()).into_owned(),
        stderr: String::from_utf8_lossy(&stderr.contents()).into_owned(),
    })
}

#[async_trait]
impl Tool for ScriptTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn execute(&self, call: &ToolCall, _limits: &ExecLimits) -> KeelResult<ToolResult> {
        let path = PathBuf::from(call.str_arg("module"));
        if path.as_os_str().is_empty() {
            return Ok(ToolResult::failure(Reason::permanent("no module given"), ""));
        }
        let input = call.str_arg("input").to_string();

        info!(module = %path.display(), fuel = self.fuel, "Running script");

        let engine = self.engine.clone();
        let fuel = self.fuel;
        // Compilation and execution are CPU-bound; keep them off the runtime.
        let outcome = tokio::task::spawn_blocking(move || {
            let module = match Module::from_file(&engine, &path) {
                Ok(m) => m,
                Err(e) => {
                    return Ok(Err(format!(
                        "failed to load module '{}': {e}",
                        path.display()
                    )))
                }
            };
            run_module(&engine, &module, &input, fuel).map(Ok)
        })
        .await
        .map_err(|e| KeelError::Tool(format!("script task panicked: {e}")))??;

        let result = match outcome {
            Err(load_error) => ToolResult::failure(Reason::permanent(load_error), ""),
            Ok(RunOutcome::OutOfFuel) => ToolResult::failure(
                Reason::timeout(format!("script exhausted its fuel budget of {fuel}")),
                "",
            ),
            Ok(RunOutcome::Exited {
                code,
                stdout,
                stderr,
            }) => {
                let stdout = truncate_output(&stdout, MAX_STDOUT);
                if code == 0 {
                    ToolResult::success(stdout).with_exit_code(0)
                } else {
                    ToolResult::failure(
                        Reason::permanent(format!(
                            "script exited with status {code}: {}",
                            truncate_output(&stderr, MAX_STDERR).trim_end()
                        )),
                        stdout,
                    )
                    .with_exit_code(code)
                }
            }
        };
        Ok(result)
    }
}
