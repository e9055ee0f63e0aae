//! Canonical Redis key layout.
//!
//! Every key in the system is built here. Stores, the queue, and the CLI all
//! go through these constructors; ad-hoc key formatting anywhere else is a
//! bug.

/// Prefixes for RediSearch document hashes. Index names match the prefix
/// without the trailing colon.
pub const TASKS_INDEX: &str = "sre_tasks";
pub const THREADS_INDEX: &str = "sre_threads";
pub const SCHEDULES_INDEX: &str = "sre_schedules";
pub const QA_INDEX: &str = "sre_qa";
pub const INSTANCES_INDEX: &str = "sre_instances";
pub const KNOWLEDGE_INDEX: &str = "sre_knowledge";

/// Key constructors for primary KV state, queue structures, and FT documents.
pub struct RedisKeys;

impl RedisKeys {
    // Thread primary state
    pub fn thread_metadata(thread_id: &str) -> String {
        format!("sre:thread:{thread_id}:metadata")
    }

    pub fn thread_context(thread_id: &str) -> String {
        format!("sre:thread:{thread_id}:context")
    }

    pub fn thread_updates(thread_id: &str) -> String {
        format!("sre:thread:{thread_id}:updates")
    }

    pub fn thread_result(thread_id: &str) -> String {
        format!("sre:thread:{thread_id}:result")
    }

    pub fn thread_error(thread_id: &str) -> String {
        format!("sre:thread:{thread_id}:error")
    }

    /// Sorted set of task ids owned by a thread, scored by creation epoch.
    pub fn thread_tasks_index(thread_id: &str) -> String {
        format!("sre:thread:{thread_id}:tasks")
    }

    /// Global sorted set of thread ids, scored by last update epoch.
    pub fn threads_index() -> String {
        "sre:threads".to_string()
    }

    // Task primary state
    pub fn task_status(task_id: &str) -> String {
        format!("sre:task:{task_id}:status")
    }

    pub fn task_metadata(task_id: &str) -> String {
        format!("sre:task:{task_id}:metadata")
    }

    pub fn task_updates(task_id: &str) -> String {
        format!("sre:task:{task_id}:updates")
    }

    pub fn task_result(task_id: &str) -> String {
        format!("sre:task:{task_id}:result")
    }

    pub fn task_error(task_id: &str) -> String {
        format!("sre:task:{task_id}:error")
    }

    // Schedules: one hash per schedule, primary and FT-indexed in place
    pub fn schedule(schedule_id: &str) -> String {
        format!("{SCHEDULES_INDEX}:{schedule_id}")
    }

    /// Sorted set of schedule ids, scored by creation epoch; KV fallback scan.
    pub fn schedules_index() -> String {
        "sre:schedules".to_string()
    }

    // FT document hashes
    pub fn task_doc(task_id: &str) -> String {
        format!("{TASKS_INDEX}:{task_id}")
    }

    pub fn thread_doc(thread_id: &str) -> String {
        format!("{THREADS_INDEX}:{thread_id}")
    }

    pub fn qa_doc(qa_id: &str) -> String {
        format!("{QA_INDEX}:{qa_id}")
    }

    pub fn instance_doc(instance_id: &str) -> String {
        format!("{INSTANCES_INDEX}:{instance_id}")
    }

    // Dedup tokens
    pub fn task_dedup(dedup_key: &str) -> String {
        format!("sre_task_dedup:{dedup_key}")
    }

    // Queue structures (worker runtime)
    pub fn queue_ready(queue: &str) -> String {
        format!("sre:queue:{queue}")
    }

    pub fn queue_scheduled(queue: &str) -> String {
        format!("sre:queue:{queue}:scheduled")
    }

    pub fn queue_claims(queue: &str) -> String {
        format!("sre:queue:{queue}:claims")
    }

    pub fn queue_job(job_id: &str) -> String {
        format!("sre:queue:job:{job_id}")
    }

    pub fn queue_failed(job_id: &str) -> String {
        format!("sre:queue:failed:{job_id}")
    }

    /// In-flight job ids sharing a concurrency key, scored by heartbeat time.
    pub fn queue_slots(concurrency_key: &str) -> String {
        format!("sre:queue:slots:{concurrency_key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thread_keys_are_scoped_by_id() {
        assert_eq!(
            RedisKeys::thread_metadata("01H0ABC"),
            "sre:thread:01H0ABC:metadata"
        );
        assert_eq!(
            RedisKeys::thread_tasks_index("01H0ABC"),
            "sre:thread:01H0ABC:tasks"
        );
    }

    #[test]
    fn ft_docs_live_under_index_prefixes() {
        assert_eq!(RedisKeys::task_doc("t1"), "sre_tasks:t1");
        assert_eq!(RedisKeys::thread_doc("th1"), "sre_threads:th1");
        assert_eq!(RedisKeys::schedule("s1"), "sre_schedules:s1");
    }

    #[test]
    fn dedup_tokens_share_a_namespace() {
        assert_eq!(
            RedisKeys::task_dedup("schedule_s1_20250101_0930"),
            "sre_task_dedup:schedule_s1_20250101_0930"
        );
    }
}
