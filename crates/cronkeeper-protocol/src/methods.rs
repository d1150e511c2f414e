// Well-known RPC method names.

// utility
pub const PING: &str = "ping";
pub const SERVER_INFO: &str = "server.info";

// task management
pub const TASKS_LIST: &str = "tasks.list";
pub const TASKS_GET: &str = "tasks.get";
pub const TASKS_ADD: &str = "tasks.add";
pub const TASKS_UPDATE: &str = "tasks.update";
pub const TASKS_REMOVE: &str = "tasks.remove";
pub const TASKS_ENABLE: &str = "tasks.enable";
pub const TASKS_DISABLE: &str = "tasks.disable";
pub const TASKS_RUN_NOW: &str = "tasks.run_now";
pub const TASKS_EXECUTIONS: &str = "tasks.executions";

/// Every method the gateway answers, in documentation order.
pub const ALL: &[&str] = &[
    PING,
    SERVER_INFO,
    TASKS_LIST,
    TASKS_GET,
    TASKS_ADD,
    TASKS_UPDATE,
    TASKS_REMOVE,
    TASKS_ENABLE,
    TASKS_DISABLE,
    TASKS_RUN_NOW,
    TASKS_EXECUTIONS,
];
