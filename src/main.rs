use clap::Parser;
use log::info;

use dualmp::{
    factors::dense_factor::DenseFactor,
    lp::{
        scheduler::Lp,
        solver::{MpRoundingSolver, SolverArgs},
        visitor::StandardVisitor,
    },
    messages::{coupling_message::CouplingMessage, message_trait::PassingSchedule},
};

// Problem readers live in the application drivers; this driver runs the
// solver on a small built-in demonstration instance, a frustrated cycle of
// three coupled variables.
fn demo_instance() -> Lp {
    let mut lp = Lp::new();
    let a = lp.add_factor(Box::new(DenseFactor::unary(vec![0., 1.])));
    let b = lp.add_factor(Box::new(DenseFactor::unary(vec![1., 0.])));
    let c = lp.add_factor(Box::new(DenseFactor::unary(vec![0., 1.])));
    lp.add_message(a, b, PassingSchedule::Full, Box::new(CouplingMessage::unary()));
    lp.add_message(b, c, PassingSchedule::Full, Box::new(CouplingMessage::unary()));
    lp.add_message(a, c, PassingSchedule::Full, Box::new(CouplingMessage::unary()));
    lp.add_relation(a, b);
    lp.add_relation(b, c);
    lp.add_relation(a, c);
    lp
}

fn main() {
    let args = SolverArgs::parse();
    let level = match args.verbosity {
        0 => "error",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    if args.input_file.is_some() {
        eprintln!("problem file readers are provided by application drivers");
        std::process::exit(1);
    }

    info!("running the built-in demonstration instance");
    let mut lp = demo_instance();
    lp.set_reparametrization_type(args.reparametrization_type.into());
    let mut solver = MpRoundingSolver::new(lp, StandardVisitor::new(args.to_options()));
    let code = solver.run();

    if let (0, Some(path)) = (code, &args.output_file) {
        let labels = solver
            .best_primal()
            .map(|snapshot| {
                snapshot
                    .iter()
                    .map(|word| word.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            })
            .unwrap_or_default();
        if let Err(err) = std::fs::write(path, labels + "\n") {
            eprintln!("could not write solution: {err}");
            std::process::exit(1);
        }
    }
    std::process::exit(code);
}
