use anyhow::Result;
use std::fmt;

/// A cluster node and the group whose policy it shares.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Node {
    pub name: String,
    pub group: String,
}

/// Lists the nodes to probe.
#[async_trait::async_trait]
pub trait Inventory: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>>;
}

/// Runs commands on nodes.
///
/// Commands run inside an ephemeral, per-node execution context. A context
/// is owned by the task that created it and must be passed back to
/// [`Executor::destroy_context`] once the task is done with it, whether or
/// not its commands succeeded.
///
/// Implementations own any retry/timeout budget; an `Err` from
/// [`Executor::run`] means that budget has been exhausted.
#[async_trait::async_trait]
pub trait Executor: Send + Sync + 'static {
    type Context: Send + Sync + 'static;

    /// Prepares resources shared by every context, e.g. a namespace.
    async fn setup(&self) -> Result<()> {
        Ok(())
    }

    async fn create_context(&self, node: &Node) -> Result<Self::Context>;

    /// Runs `argv` on the context's node and returns its stdout.
    async fn run(&self, ctx: &Self::Context, argv: &[&str]) -> Result<Vec<u8>>;

    async fn destroy_context(&self, ctx: Self::Context) -> Result<()>;

    /// Releases the resources created by [`Executor::setup`].
    async fn teardown(&self) -> Result<()> {
        Ok(())
    }
}

// === impl Node ===

impl Node {
    pub fn new(name: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
