//! Pure parsing for the SLURM command surface JobPoller and StateManager's
//! reconciliation pass both depend on. Kept framework-free and shared so the
//! two call sites never drift on state-mapping rules, the same rationale
//! SPEC_FULL.md gives for the cookie/header rewriting helpers.

use crate::model::{EndReason, Ide};

/// One row of the batched job-listing command, or the result of the
/// single-job inspector. `ide` is only ever populated from the batched
/// listing, which carries the job name (`hpc-<ide>`); the single-job
/// inspector doesn't need it since the caller already knows which session
/// it's asking about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    pub job_id: String,
    pub state: String,
    pub node: Option<String>,
    pub time_left_seconds: Option<i64>,
    pub ide: Option<Ide>,
}

/// `true` for `PENDING`/`RUNNING` lookalikes, allowing for SLURM's
/// `RUNNING+` / `CONFIGURING` suffixes by checking prefixes.
pub fn is_pending(state: &str) -> bool {
    state.starts_with("PENDING") || state.starts_with("CONFIGURING")
}

pub fn is_running(state: &str) -> bool {
    state.starts_with("RUNNING")
}

pub fn is_terminal(state: &str) -> bool {
    matches!(state, "COMPLETED" | "FAILED" | "CANCELLED" | "TIMEOUT") || state.starts_with("CANCELLED")
}

pub fn end_reason_for_state(state: &str) -> EndReason {
    if state.starts_with("CANCELLED") {
        EndReason::Cancelled
    } else {
        match state {
            "COMPLETED" => EndReason::Completed,
            "TIMEOUT" => EndReason::Timeout,
            "FAILED" => EndReason::Error,
            _ => EndReason::Completed,
        }
    }
}

/// Parses the batched job-listing command's output: one job per line,
/// pipe-delimited `jobid|state|node|time_left_seconds|jobname`. A dash (`-`)
/// in `node` or `time_left_seconds` means SLURM hasn't assigned one yet
/// (queued job).
pub fn parse_job_list(output: &str) -> Vec<JobInfo> {
    output.lines().filter_map(parse_job_line).collect()
}

/// Parses the single-job inspector's output: the same pipe-delimited shape
/// minus the job name (the caller already knows which session this is).
pub fn parse_single_job(job_id: &str, output: &str) -> Option<JobInfo> {
    let line = output.lines().next()?;
    let mut fields = line.split('|');
    let _job_id = fields.next()?;
    let state = fields.next()?.trim().to_string();
    let node = fields.next().map(str::trim).filter(|s| !s.is_empty() && *s != "-");
    let time_left_seconds = fields.next().and_then(|s| s.trim().parse::<i64>().ok());
    Some(JobInfo { job_id: job_id.to_string(), state, node: node.map(str::to_string), time_left_seconds, ide: None })
}

fn parse_job_line(line: &str) -> Option<JobInfo> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let mut fields = line.split('|');
    let job_id = fields.next()?.trim().to_string();
    let state = fields.next()?.trim().to_string();
    let node = fields.next().map(str::trim).filter(|s| !s.is_empty() && *s != "-").map(str::to_string);
    let time_left_seconds = fields.next().and_then(|s| s.trim().parse::<i64>().ok());
    let job_name = fields.next().map(str::trim).unwrap_or("");
    let ide = job_name.strip_prefix("hpc-").and_then(Ide::parse);

    Some(JobInfo { job_id, state, node, time_left_seconds, ide })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pending_job_with_no_node_yet() {
        let jobs = parse_job_list("501|PENDING|-|-|hpc-vscode");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].job_id, "501");
        assert!(jobs[0].node.is_none());
        assert_eq!(jobs[0].ide, Some(Ide::Vscode));
    }

    #[test]
    fn parses_running_job_with_node_and_time_left() {
        let jobs = parse_job_list("502|RUNNING|cn-07|3600|hpc-jupyter");
        assert_eq!(jobs[0].node.as_deref(), Some("cn-07"));
        assert_eq!(jobs[0].time_left_seconds, Some(3600));
        assert_eq!(jobs[0].ide, Some(Ide::Jupyter));
    }

    #[test]
    fn ignores_blank_lines() {
        let jobs = parse_job_list("501|PENDING|-|-|hpc-vscode\n\n502|RUNNING|cn-07|3600|hpc-jupyter\n");
        assert_eq!(jobs.len(), 2);
    }

    #[test]
    fn single_job_inspector_omits_name() {
        let job = parse_single_job("501", "501|RUNNING|cn-07|1800").unwrap();
        assert_eq!(job.state, "RUNNING");
        assert_eq!(job.node.as_deref(), Some("cn-07"));
        assert!(job.ide.is_none());
    }

    #[test]
    fn single_job_inspector_returns_none_for_empty_output() {
        assert!(parse_single_job("501", "").is_none());
    }

    #[test]
    fn state_classification_and_end_reason_mapping() {
        assert!(is_pending("PENDING"));
        assert!(is_running("RUNNING"));
        assert!(is_terminal("COMPLETED"));
        assert!(is_terminal("FAILED"));
        assert!(is_terminal("CANCELLED"));
        assert!(is_terminal("CANCELLED by 1001"));
        assert!(is_terminal("TIMEOUT"));
        assert!(!is_terminal("RUNNING"));

        assert_eq!(end_reason_for_state("COMPLETED"), EndReason::Completed);
        assert_eq!(end_reason_for_state("FAILED"), EndReason::Error);
        assert_eq!(end_reason_for_state("CANCELLED"), EndReason::Cancelled);
        assert_eq!(end_reason_for_state("TIMEOUT"), EndReason::Timeout);
    }
}
