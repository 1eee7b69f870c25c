pub mod v1 {
    #![allow(
        clippy::all,
        dead_code,
        non_camel_case_types,
        non_snake_case,
        non_upper_case_globals,
        unused_imports,
        unused_variables
    )]
    tonic::include_proto!("bosun.v1");
    include!(concat!(env!("OUT_DIR"), "/bosun.v1.serde.rs"));
}

pub mod runner {
    pub mod v1 {
        #![allow(
            clippy::all,
            dead_code,
            non_camel_case_types,
            non_snake_case,
            non_upper_case_globals,
            unused_imports,
            unused_variables
        )]
        tonic::include_proto!("bosun.runner.v1");
        include!(concat!(env!("OUT_DIR"), "/bosun.runner.v1.serde.rs"));
    }
}

pub mod eval {
    pub mod v1 {
        #![allow(
            clippy::all,
            dead_code,
            non_camel_case_types,
            non_snake_case,
            non_upper_case_globals,
            unused_imports,
            unused_variables
        )]
        tonic::include_proto!("bosun.eval.v1");
        include!(concat!(env!("OUT_DIR"), "/bosun.eval.v1.serde.rs"));
    }
}
