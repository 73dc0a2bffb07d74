// We don't control the codegen, so disable any code warnings in the
// proto modules.
#[allow(warnings)]
#[allow(clippy::derive_partial_eq_without_eq)]
pub mod node {
	pub mod v1 {
		tonic::include_proto!("vstat.node.v1");
	}
}

#[allow(warnings)]
#[allow(clippy::derive_partial_eq_without_eq)]
pub mod sub {
	pub mod v1 {
		tonic::include_proto!("vstat.sub.v1");
	}
}

#[allow(warnings)]
#[allow(clippy::derive_partial_eq_without_eq)]
pub mod xray {
	pub mod stats {
		tonic::include_proto!("xray.app.stats.command");
	}
}
