pub mod raw_socket;
pub mod xdp_loader;
