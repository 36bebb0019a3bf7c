//! 依赖图执行器（次级 API）
//!
//! 用邻接表与入度表做 DAG 拓扑排序；失败任务的所有下游被跳过（skip_downstream）。
//! 自适应主循环不使用本执行器：指令里不表达任务间依赖，按 Step 整批派发。

use std::collections::HashMap;

use crate::agents::AgentRegistry;
use crate::core::HiveError;
use crate::run::{StepTask, TaskResult};

/// 带依赖的任务
#[derive(Debug, Clone)]
pub struct DagTask {
    pub id: String,
    pub task: String,
    pub agent: Option<String>,
    pub depends_on: Vec<String>,
}

/// 任务依赖图
#[derive(Debug)]
pub struct TaskGraph {
    tasks: Vec<DagTask>,
    adjacency: HashMap<String, Vec<String>>,
    in_degree: HashMap<String, usize>,
}

impl TaskGraph {
    /// 构建并校验：重复 id、自环、未知依赖与环都被拒绝
    pub fn new(tasks: Vec<DagTask>) -> Result<Self, HiveError> {
        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        let mut in_degree: HashMap<String, usize> = HashMap::new();

        for task in &tasks {
            if in_degree.contains_key(&task.id) {
                return Err(HiveError::Validation(format!(
                    "Duplicate task id '{}'",
                    task.id
                )));
            }
            in_degree.insert(task.id.clone(), 0);
            adjacency.insert(task.id.clone(), Vec::new());
        }

        for task in &tasks {
            for dep in &task.depends_on {
                if dep == &task.id {
                    return Err(HiveError::Validation(format!(
                        "Task '{}' depends on itself",
                        task.id
                    )));
                }
                if !adjacency.contains_key(dep) {
                    return Err(HiveError::Validation(format!(
                        "Task '{}' depends on unknown task '{}'",
                        task.id, dep
                    )));
                }
                adjacency.get_mut(dep).unwrap().push(task.id.clone());
                *in_degree.get_mut(&task.id).unwrap() += 1;
            }
        }

        let graph = Self {
            tasks,
            adjacency,
            in_degree,
        };
        // Kahn 排序能覆盖全部节点才是无环
        if graph.topo_order().len() != graph.tasks.len() {
            return Err(HiveError::Validation("Task graph contains a cycle".to_string()));
        }
        Ok(graph)
    }

    /// Kahn 拓扑排序，同层按插入顺序稳定
    pub fn topo_order(&self) -> Vec<String> {
        let mut in_degree = self.in_degree.clone();
        let mut order = Vec::with_capacity(self.tasks.len());
        let mut ready: Vec<String> = self
            .tasks
            .iter()
            .filter(|t| in_degree[&t.id] == 0)
            .map(|t| t.id.clone())
            .collect();

        while let Some(id) = ready.first().cloned() {
            ready.remove(0);
            order.push(id.clone());
            if let Some(dependents) = self.adjacency.get(&id) {
                for dependent in dependents {
                    let degree = in_degree.get_mut(dependent).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(dependent.clone());
                    }
                }
            }
        }
        order
    }

    /// 逐层执行：就绪集并行（窗口受限），失败任务的传递闭包下游跳过
    pub async fn execute(
        &self,
        registry: &AgentRegistry,
        max_concurrency: usize,
        skip_downstream: bool,
    ) -> Vec<StepTask> {
        let window = max_concurrency.max(1);
        let by_id: HashMap<&str, &DagTask> =
            self.tasks.iter().map(|t| (t.id.as_str(), t)).collect();

        let mut results: HashMap<String, StepTask> = HashMap::new();
        let mut skipped: Vec<String> = Vec::new();

        let order = self.topo_order();
        let mut remaining: Vec<&str> = order.iter().map(String::as_str).collect();

        while !remaining.is_empty() {
            // 就绪：全部依赖已有结果且未被跳过
            let ready: Vec<&str> = remaining
                .iter()
                .copied()
                .filter(|id| {
                    by_id[id]
                        .depends_on
                        .iter()
                        .all(|dep| results.contains_key(dep) || skipped.contains(dep))
                })
                .collect();
            if ready.is_empty() {
                break;
            }
            remaining.retain(|id| !ready.contains(id));

            for batch in ready.chunks(window) {
                let futures = batch.iter().map(|id| {
                    let dag_task = by_id[*id];
                    let failed_dep = dag_task.depends_on.iter().find(|dep| {
                        skipped.iter().any(|s| &s == dep)
                            || results
                                .get(dep.as_str())
                                .map(|r| r.status == crate::run::TaskState::Failed)
                                .unwrap_or(false)
                    });
                    async move {
                        let mut task =
                            StepTask::new(&dag_task.id, &dag_task.task, dag_task.agent.clone());
                        if skip_downstream {
                            if let Some(dep) = failed_dep {
                                task.finish(TaskResult::error(
                                    format!("Skipped due to failed dependency '{}'", dep),
                                    0,
                                ));
                                return (true, task);
                            }
                        }

                        let started = std::time::Instant::now();
                        let adapter = match &dag_task.agent {
                            Some(hint) => registry.pick(hint).await.or(registry.first().await),
                            None => registry.first().await,
                        };
                        let result = match adapter {
                            None => TaskResult::error(
                                format!("No agent available for task '{}'", dag_task.id),
                                started.elapsed().as_millis() as u64,
                            ),
                            Some(adapter) => match adapter.execute(&dag_task.task).await {
                                Ok(r) => r,
                                Err(e) => TaskResult::error(
                                    e.to_string(),
                                    started.elapsed().as_millis() as u64,
                                ),
                            },
                        };
                        task.finish(result);
                        (false, task)
                    }
                });

                for (was_skipped, task) in futures_util::future::join_all(futures).await {
                    if was_skipped {
                        skipped.push(task.id.clone());
                    }
                    results.insert(task.id.clone(), task);
                }
            }
        }

        // 按插入顺序返回
        self.tasks
            .iter()
            .filter_map(|t| results.remove(&t.id))
            .collect()
    }
}
