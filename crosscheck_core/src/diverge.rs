use crate::executor::{Architecture, Backend, Executor};
use crate::result::ExecutionResult;

/// Identity of an executor, detached from the executor itself so events can
/// carry it without borrowing the campaign's executor list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSummary {
    pub name: String,
    pub architecture: Architecture,
    pub backend: Backend,
    pub bisectable: bool,
}

impl ExecutorSummary {
    pub fn of(executor: &dyn Executor) -> Self {
        Self {
            name: executor.name().to_string(),
            architecture: executor.architecture(),
            backend: executor.backend(),
            bisectable: executor.is_bisectable(),
        }
    }
}

/// Canonical identity of an execution outcome: the flattened output plus
/// the return code. Two executors agree iff their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResultKey {
    pub flattened_output: String,
    pub return_code: i32,
}

impl ResultKey {
    pub fn of(result: &ExecutionResult) -> Self {
        Self {
            flattened_output: result.flattened_output().to_string(),
            return_code: result.return_code(),
        }
    }
}

/// One cell of the divergence partition: every executor whose run produced
/// this exact outcome, plus a representative result.
#[derive(Debug, Clone)]
pub struct DivergenceGroup {
    pub key: ResultKey,
    pub result: ExecutionResult,
    pub members: Vec<ExecutorSummary>,
}

/// Partition one iteration's results by canonical key. Every executor lands
/// in exactly one group; a single group means all backends agreed. The
/// partition depends only on content equality, so any iteration order of
/// the executors yields the same groups (group order follows first
/// appearance).
pub fn group_results(runs: &[(ExecutorSummary, ExecutionResult)]) -> Vec<DivergenceGroup> {
    let mut groups: Vec<DivergenceGroup> = Vec::new();
    for (summary, result) in runs {
        let key = ResultKey::of(result);
        match groups.iter_mut().find(|group| group.key == key) {
            Some(group) => group.members.push(summary.clone()),
            None => groups.push(DivergenceGroup {
                key,
                result: result.clone(),
                members: vec![summary.clone()],
            }),
        }
    }
    groups
}

/// Whether a divergence boundary coincides exactly with an architecture
/// boundary: two groups, each internally architecture-homogeneous, with
/// two distinct architectures. Such splits match known accepted semantic
/// differences between targets and are benign.
pub fn is_architecture_split(groups: &[DivergenceGroup]) -> bool {
    if groups.len() != 2 {
        // Cannot have a two-way split without exactly two kinds of output.
        return false;
    }
    let mut architectures = [Architecture::Arm; 2];
    for (idx, group) in groups.iter().enumerate() {
        let Some(first) = group.members.first() else {
            return false;
        };
        if group
            .members
            .iter()
            .any(|member| member.architecture != first.architecture)
        {
            return false;
        }
        architectures[idx] = first.architecture;
    }
    architectures[0] != architectures[1]
}

/// The text a bisection search compares against: every output line except
/// the trailing synthetic return-code line, newline separated.
pub fn expected_text(result: &ExecutionResult) -> String {
    let lines = result.output();
    let content = match lines.last() {
        Some(last) if last.starts_with("RETURN CODE:") => &lines[..lines.len() - 1],
        _ => lines,
    };
    let mut text = String::new();
    for line in content {
        text.push_str(line);
        text.push('\n');
    }
    text
}
