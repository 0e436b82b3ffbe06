tonic::include_proto!("jobworker");
