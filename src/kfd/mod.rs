pub mod device;
pub mod events;
pub mod io_link;
pub mod ioctl;
pub mod node;
pub mod process;
