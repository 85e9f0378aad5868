/// Build step: make, cmake or a direct compiler invocation
use super::diagnostics;
use super::runner::StepContext;
use crate::config::types::Result;
use crate::results::{html, PipeResult};
use crate::sandbox::{CommandOutput, EntryKind};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::Path;
use walkdir::WalkDir;

const C_EXTENSIONS: &[&str] = &["c"];
const CXX_EXTENSIONS: &[&str] = &["cpp", "cc", "cxx"];
pub const BUILD_LOG: &str = "build.log";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildParams {
    /// Compiler to use; `gcc`, or `g++` when C++ sources are present
    pub compiler: Option<String>,
    pub flags: Vec<String>,
    /// Appended after the sources
    pub ldflags: Vec<String>,
    /// Explicit source list; discovered when empty
    pub sources: Vec<String>,
    pub output: String,
    pub cmake_flags: Vec<String>,
}

impl Default for BuildParams {
    fn default() -> Self {
        Self {
            compiler: None,
            flags: vec!["-g".to_string(), "-Wall".to_string(), "-Wextra".to_string()],
            ldflags: vec!["-lm".to_string()],
            sources: Vec::new(),
            output: "main".to_string(),
            cmake_flags: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildSystem {
    Make,
    CMake,
    Compiler,
}

impl BuildSystem {
    /// `make`/`cmake` step types force the system; otherwise the workspace decides
    pub fn detect(type_name: &str, workspace: &Path) -> Self {
        match type_name {
            "make" => BuildSystem::Make,
            "cmake" => BuildSystem::CMake,
            _ if ["Makefile", "makefile", "GNUmakefile"]
                .iter()
                .any(|m| workspace.join(m).is_file()) =>
            {
                BuildSystem::Make
            }
            _ if workspace.join("CMakeLists.txt").is_file() => BuildSystem::CMake,
            _ => BuildSystem::Compiler,
        }
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|e| e.to_str())
}

/// C and C++ sources under `root`, relative and sorted; hidden entries skipped
pub fn discover_sources(root: &Path) -> Vec<String> {
    let mut sources: Vec<String> = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'))
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            extension(e.path())
                .map(|ext| C_EXTENSIONS.contains(&ext) || CXX_EXTENSIONS.contains(&ext))
                .unwrap_or(false)
        })
        .filter_map(|e| {
            e.path()
                .strip_prefix(root)
                .ok()
                .map(|p| p.to_string_lossy().into_owned())
        })
        .collect();
    sources.sort();
    sources
}

pub fn compiler_for(params: &BuildParams, sources: &[String]) -> String {
    if let Some(compiler) = &params.compiler {
        return compiler.clone();
    }
    let cxx = sources.iter().any(|s| {
        extension(Path::new(s))
            .map(|ext| CXX_EXTENSIONS.contains(&ext))
            .unwrap_or(false)
    });
    if cxx { "g++" } else { "gcc" }.to_string()
}

fn record(pipe: &mut PipeResult, log: &mut String, command: &str, output: &CommandOutput) {
    let combined = output.combined();
    pipe.html
        .push_str(&html::command_block(command, Some(&combined), output.exit_code()));
    log.push_str(&format!("$ {}\n{}", command, combined));
    for error in output.usage.errors() {
        pipe.html.push_str(&html::error(&error));
    }
}

pub fn run(ctx: &mut StepContext<'_>, params: &BuildParams) -> Result<PipeResult> {
    let mut pipe = ctx.new_pipe();
    let limits = ctx.build_limits();
    let system = BuildSystem::detect(&ctx.spec.type_name, ctx.sandbox.workspace());
    info!("building with {:?}", system);

    let mut log = String::new();
    let mut tool = "make".to_string();
    let success = match system {
        BuildSystem::Make => {
            let out = ctx.sandbox.run_shell("make", limits)?;
            record(&mut pipe, &mut log, "make", &out);
            out.success()
        }
        BuildSystem::CMake => {
            let configure = format!("cmake -S . -B build {}", params.cmake_flags.join(" "));
            let configure = configure.trim_end();
            let out = ctx.sandbox.run_shell(configure, limits.clone())?;
            record(&mut pipe, &mut log, configure, &out);
            let mut ok = out.success();
            if ok {
                let out = ctx.sandbox.run_shell("cmake --build build", limits)?;
                record(&mut pipe, &mut log, "cmake --build build", &out);
                ok = out.success();
            }
            let built = format!("build/{}", params.output);
            if ok && !ctx.sandbox.exists(&params.output) {
                match ctx.sandbox.kind(&built)? {
                    Some(EntryKind::File) => ctx.sandbox.copy_within(&built, &params.output)?,
                    Some(kind) => {
                        pipe.html.push_str(&html::error(&format!("{} is {}", built, kind)));
                        ok = false;
                    }
                    None => {}
                }
            }
            ok
        }
        BuildSystem::Compiler => {
            let sources = if params.sources.is_empty() {
                discover_sources(ctx.sandbox.workspace())
            } else {
                params.sources.clone()
            };
            if sources.is_empty() {
                pipe.html = html::error("No source files found");
                pipe.failed = true;
                return Ok(pipe);
            }
            tool = compiler_for(params, &sources);
            debug!("compiling {:?} with {}", sources, tool);

            let mut flags = params.flags.clone();
            flags.extend(params.ldflags.iter().cloned());
            let out = ctx
                .sandbox
                .compile(&tool, &flags, &sources, &params.output, limits)?;
            let command = format!(
                "{} {} -o {} {}",
                tool,
                sources.join(" "),
                params.output,
                flags.join(" ")
            );
            record(&mut pipe, &mut log, command.trim_end(), &out);
            out.success()
        }
    };

    let count = diagnostics::attach(&mut pipe, &log, &tool);
    debug!("{} diagnostics", count);
    ctx.persist(BUILD_LOG, log.as_bytes())?;

    pipe.failed = !success;
    Ok(pipe)
}
