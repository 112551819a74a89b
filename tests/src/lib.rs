//! Shared callables for the cross-crate scenarios.

use flowrun::{flow, task, CoreError, ManagedFn, ParamType, ParameterSpec};
use serde_json::json;

/// Flow that looks up a repository; `"missing/repo"` always fails
pub fn get_repo_info() -> Result<ManagedFn, CoreError> {
    flow("get_repo_info")
        .parameter(ParameterSpec::required("repo_name", ParamType::String))
        .run_name("repo-{repo_name}")
        .build(|ctx| async move {
            let repo: String = ctx.parameter("repo_name")?;
            if repo == "missing/repo" {
                anyhow::bail!("404 Not Found for {}", repo);
            }
            ctx.log(flowrun::LogLevel::Info, format!("Fetched {}", repo))
                .await?;
            Ok::<_, anyhow::Error>(json!({"full_name": repo, "stargazers_count": 17000}))
        })
}

/// Task that doubles a number
pub fn double() -> Result<ManagedFn, CoreError> {
    task("double")
        .parameter(ParameterSpec::required("x", ParamType::Integer))
        .build(|ctx| async move {
            let x: i64 = ctx.parameter("x")?;
            Ok::<_, anyhow::Error>(x * 2)
        })
}
