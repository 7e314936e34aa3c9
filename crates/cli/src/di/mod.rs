mod forwarding;

pub use forwarding::DotServices;
