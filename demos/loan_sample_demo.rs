use std::error::Error;

fn main() -> Result<(), Box<dyn Error>> {
    strata_sampler::example_apps::run_loan_sample_demo(std::env::args().skip(1))
}
