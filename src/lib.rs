pub mod session;
pub mod transport;
pub mod util;
pub mod wire;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor(unsafe)]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
