/// Times one solver query and reports it at debug level alongside the
/// query description.
macro_rules! timed_query {
    ($query:expr, $body:block) => {{
        let started = std::time::Instant::now();
        let outcome = $body;
        log::debug!("query {} decided in {:?}", $query, started.elapsed());
        outcome
    }};
}

/// Times a whole engine phase (exploration, dumping) at info level.
macro_rules! timed_phase {
    ($phase:expr, $body:block) => {{
        let started = std::time::Instant::now();
        let outcome = $body;
        log::info!("{} finished in {:?}", $phase, started.elapsed());
        outcome
    }};
}
