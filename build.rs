// parallex: build-time validation of the default worker pool sizing

fn main() {
    validate_default_worker_count();
    println!("cargo:warning=Building parallex with a {}-worker default pool", DEFAULT_WORKER_COUNT);
}

// Kept in sync with `PoolConfig::DEFAULT_WORKER_COUNT` by hand -- there is no
// way to `include!` a `const` from `src/` into a build script without a
// shared third crate, and this crate is too small to warrant one.
const DEFAULT_WORKER_COUNT: u32 = 4;

fn validate_default_worker_count() {
    const _: () = {
        if DEFAULT_WORKER_COUNT == 0 {
            panic!("default worker count must be at least 1");
        }
    };

    println!("cargo:rustc-env=PARALLEX_DEFAULT_WORKER_COUNT={}", DEFAULT_WORKER_COUNT);
}