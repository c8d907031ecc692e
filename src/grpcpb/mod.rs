//! Generated protobuf/tonic bindings for the UTCP tool service and the gNMI
//! telemetry subset (see `proto/`).

pub mod utcp {
    tonic::include_proto!("utcp");
}

pub mod gnmi {
    tonic::include_proto!("gnmi");
}
