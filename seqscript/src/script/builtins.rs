//! Built-in commands.
//!
//! Each handler receives the interpreter and the already substituted
//! [`Args`].  Handlers that finish at once return `Ok(None)` and the caller
//! continues according to the command's flags; `Delay` and `Pause` return
//! the [`Step`] that hands control back to the scheduler.

use std::time::Duration;

use crate::error::{ScriptError, ScriptResult};

use super::{
    args::Args,
    commands::Builtin,
    interp::{Interpreter, Step},
    value::{format_float, Value},
    vars::{Scope, Variable},
};

/// Run built-in command `b`.
pub(crate) fn run(interp: &mut Interpreter, b: Builtin, args: &Args) -> ScriptResult<Option<Step>> {
    let abort = ScriptError::abort;
    match b {
        // ── Output ───────────────────────────────────────────────────────────
        Builtin::Echo | Builtin::EchoEval => interp.output.push(args.tail().to_owned()),
        Builtin::Verbose => interp.verbose = args.int(0) != 0,

        // ── Variables ────────────────────────────────────────────────────────
        Builtin::SetVariable | Builtin::SetPersistentVar => {
            let scope = if b == Builtin::SetPersistentVar { Scope::Persistent } else { Scope::Regular };
            let name = args.str(0);
            let var = if args.len() == 2 {
                Variable::scalar(name, scope, &Value::parse(args.str(1)))
            } else {
                Variable::array(name, scope, args.items()[1..].to_vec())
            };
            interp.vars.store(var).map_err(abort)?;
        }
        Builtin::LocalVar => {
            for name in args.items() {
                if !interp.vars.contains(name)
                    || interp.vars.lookup(name).is_some_and(|v| v.scope() != Scope::CallLocal)
                {
                    interp.vars.set(name, &Value::Str(String::new()), Scope::CallLocal).map_err(abort)?;
                }
            }
        }
        Builtin::ClearPersistentVars => interp.vars.clear(Scope::Persistent),
        Builtin::IsVariableDefined => {
            let defined = interp.vars.contains(args.str(0));
            interp.vars.set_reports(&[Value::from(defined)]);
        }

        // ── Arrays ───────────────────────────────────────────────────────────
        Builtin::NewArray => {
            let var = Variable::array(args.str(0), Scope::Regular, args.items()[1..].to_vec());
            interp.vars.store(var).map_err(abort)?;
        }
        Builtin::New2DArray => {
            interp.vars.store(Variable::array_2d(args.str(0), Scope::Regular)).map_err(abort)?;
        }
        Builtin::AppendToArray => {
            interp.vars.append(args.str(0), args.items()[1..].to_vec()).map_err(abort)?;
        }
        Builtin::AppendRowToArray => {
            interp.vars.append_row(args.str(0), args.items()[1..].to_vec()).map_err(abort)?;
        }
        Builtin::TruncateArray => {
            if !args.is_number(1) || args.int(1) < 0 {
                return Err(abort(format!("TruncateArray needs a count of 0 or more, not '{}'", args.str(1))));
            }
            let n = usize::try_from(args.int(1)).map_err(|e| abort(e.to_string()))?;
            interp.vars.truncate(args.str(0), n).map_err(abort)?;
        }
        Builtin::ArrayStatistics => {
            let stats = {
                let var = interp
                    .vars
                    .lookup(args.str(0))
                    .ok_or_else(|| abort(format!("variable {} is not defined", args.str(0))))?;
                statistics(var)?
            };
            interp.vars.set_reports(&stats);
            interp.output.push(format!(
                "n = {}  min = {}  max = {}  mean = {}  sd = {}",
                stats[0], stats[1], stats[2], stats[3], stats[4]
            ));
        }
        Builtin::StringLength => {
            let n = args.tail().chars().count();
            interp.vars.set_reports(&[Value::Int(n as i64)]);
        }

        // ── Waiting ──────────────────────────────────────────────────────────
        Builtin::Delay => return delay(args).map(|d| Some(Step::Wait(d))),
        Builtin::Pause => {
            let msg = if args.tail().is_empty() { "Pause".to_owned() } else { args.tail().to_owned() };
            return Ok(Some(Step::Pause(msg)));
        }
    }
    Ok(None)
}

/// `n`, min, max, mean and sample standard deviation of a numeric array.
fn statistics(var: &Variable) -> ScriptResult<Vec<Value>> {
    let xs = var
        .elements()
        .map(|e| match Value::parse(e) {
            v if v.is_numeric() => Ok(v.as_float()),
            _ => Err(ScriptError::abort(format!("{} has a non-numeric element '{e}'", var.name()))),
        })
        .collect::<ScriptResult<Vec<f64>>>()?;
    if xs.is_empty() {
        return Err(ScriptError::abort(format!("{} has no elements", var.name())));
    }
    let n = xs.len() as f64;
    let min = xs.iter().copied().fold(f64::INFINITY, f64::min);
    let max = xs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mean = xs.iter().sum::<f64>() / n;
    let sd = if xs.len() > 1 {
        (xs.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
    } else {
        0.0
    };
    Ok(vec![
        Value::Int(xs.len() as i64),
        Value::parse(&format_float(min)),
        Value::parse(&format_float(max)),
        Value::Float(mean),
        Value::Float(sd),
    ])
}

/// `Delay amount [sec|msec|min]`; seconds when no unit is given.
fn delay(args: &Args) -> ScriptResult<Duration> {
    if !args.is_number(0) {
        return Err(ScriptError::abort(format!("Delay amount '{}' is not a number", args.str(0))));
    }
    let scale = match args.str(1).to_ascii_lowercase().as_str() {
        "" | "s" | "sec" | "secs" | "seconds" => 1.0,
        "ms" | "msec" | "msecs" => 0.001,
        "min" | "mins" | "minutes" => 60.0,
        unit => return Err(ScriptError::abort(format!("unknown Delay unit '{unit}'"))),
    };
    let secs = args.float(0) * scale;
    Duration::try_from_secs_f64(secs.max(0.0)).map_err(|e| ScriptError::abort(format!("bad Delay: {e}")))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::script::{commands::CommandTable, library::ScriptLibrary, ops::NoOperations};

    /// Run `src` and return the interpreter plus the step that stopped it.
    fn run_script(src: &str) -> (Interpreter, ScriptResult<Step>) {
        let mut lib = ScriptLibrary::new();
        lib.load_source("t", src).unwrap();
        let mut it = Interpreter::new(lib, CommandTable::builtin(), &EngineConfig::default());
        it.start("t").unwrap();
        loop {
            match it.step(&mut NoOperations) {
                Ok(Step::Continue { .. }) => {}
                other => return (it, other),
            }
        }
    }

    fn report(it: &Interpreter, n: usize) -> String {
        it.variables().get(&format!("repVal{n}")).unwrap_or_default()
    }

    #[test]
    fn set_variable_scalar_and_array() {
        let (it, r) = run_script("SetVariable a (2 * 3)\nSetVariable b 1 2 3\nSetPersistentVar p x");
        assert_eq!(r.unwrap(), Step::Finished);
        let v = it.variables();
        assert_eq!(v.get("a").as_deref(), Some("6"));
        assert_eq!(v.lookup("b").map(Variable::element_count), Some(3));
        assert_eq!(v.lookup("p").map(Variable::scope), Some(Scope::Persistent));
    }

    #[test]
    fn is_variable_defined_reports() {
        let (it, _) = run_script("x = 1\nIsVariableDefined x\ny @= $repVal1\nIsVariableDefined nope");
        assert_eq!(it.variables().get("y").as_deref(), Some("1"));
        assert_eq!(report(&it, 1), "0");
    }

    #[test]
    fn array_building() {
        let src = "\
NewArray a 1 2
AppendToArray a 3 (2 + 2)
TruncateArray a 3
New2DArray g
AppendRowToArray g 1 2
AppendRowToArray g 3 4 5
Echo $#a $a $#g $#g[2] $g[2][3]";
        let (mut it, r) = run_script(src);
        assert_eq!(r.unwrap(), Step::Finished);
        assert_eq!(it.take_output(), vec!["3 1 2 3 2 3 5"]);
    }

    #[test]
    fn truncate_rejects_bad_counts() {
        assert!(run_script("NewArray a 1 2\nTruncateArray a 5").1.is_err());
        assert!(run_script("NewArray a 1 2\nTruncateArray a -1").1.is_err());
        assert!(run_script("NewArray a 1 2\nAppendRowToArray a 1").1.is_err());
    }

    #[test]
    fn array_statistics() {
        let (it, r) = run_script("NewArray a 2 4 4 4 5 5 7 9\nArrayStatistics a");
        assert_eq!(r.unwrap(), Step::Finished);
        assert_eq!(report(&it, 1), "8");
        assert_eq!(report(&it, 2), "2");
        assert_eq!(report(&it, 3), "9");
        assert_eq!(report(&it, 4), "5");
        let sd: f64 = report(&it, 5).parse().unwrap();
        assert!((sd - 2.138).abs() < 1e-3);
        assert!(run_script("NewArray a 1 x\nArrayStatistics a").1.is_err());
    }

    #[test]
    fn string_length_and_echo_eval() {
        let (mut it, _) = run_script("StringLength hello world\nEchoEval len (1 + $repVal1)");
        assert_eq!(it.take_output(), vec!["len 12"]);
    }

    #[test]
    fn local_var_shadows_global() {
        let src = "\
x = 1
CallFunction F
Echo $x
Function F
  LocalVar x
  x = 2
  Echo $x
EndFunction";
        let (mut it, _) = run_script(src);
        assert_eq!(it.take_output(), vec!["2", "1"]);
    }

    #[test]
    fn delay_and_pause_yield() {
        let (_, r) = run_script("Delay 250 msec");
        assert_eq!(r.unwrap(), Step::Wait(Duration::from_millis(250)));
        let (_, r) = run_script("Delay 2");
        assert_eq!(r.unwrap(), Step::Wait(Duration::from_secs(2)));
        assert!(run_script("Delay 2 fortnights").1.is_err());
        let (_, r) = run_script("Pause check the \"sample\"");
        assert_eq!(r.unwrap(), Step::Pause("check the \"sample\"".into()));
    }

    #[test]
    fn verbose_echoes_lines() {
        let (mut it, _) = run_script("Verbose 1\nx = 3");
        assert_eq!(it.take_output(), vec!["> x = 3"]);
    }
}
