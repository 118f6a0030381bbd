pub mod collective;
pub mod config;
pub mod freeze;
pub mod messaging;
pub mod node;
pub mod rpc;
pub mod test_util;
pub mod topology;
pub mod util;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
