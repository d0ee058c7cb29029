use clap::{Parser as ClapParser, Subcommand};
use log::LevelFilter;
use std::process;

use alien::{
    AlienResult,
    abi::{Classifier, classifier, classify},
    ctype::{
        Abi, CallConv, Extend, FunctionLayout, FunctionSignature, PassMode, Piece, PrimitiveKind,
        RecordBuilder, TypeRef, TypeRegistry,
    },
};

#[derive(ClapParser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Raise the log level (-v debug, -vv trace); RUST_LOG still wins
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the supported ABIs and the host ABI
    Abis,

    /// Print where every byte of one signature travels
    Classify {
        #[arg(long, help = "Target ABI, defaults to the host")]
        abi: Option<String>,

        #[arg(long, default_value = "cdecl", help = "cdecl, stdcall, fastcall or thiscall")]
        conv: String,

        #[arg(long, default_value = "void", help = "Return type keyword or recN")]
        ret: String,

        #[arg(long = "param", help = "Parameter type keyword or recN, repeatable")]
        params: Vec<String>,

        #[arg(long, help = "Parameters from this index on are variadic")]
        variadic_from: Option<usize>,

        #[arg(long = "record", help = "Struct of comma-separated keywords, named rec0, rec1, ...")]
        records: Vec<String>,
    },
}

struct Types {
    registry: TypeRegistry,
    records: Vec<TypeRef>,
}

impl Types {
    fn new(abi: Abi, records: &[String]) -> Result<Types, String> {
        let mut types = Types {
            registry: TypeRegistry::new(abi.data_model()),
            records: Vec::new(),
        };
        for (i, fields) in records.iter().enumerate() {
            let mut builder = RecordBuilder::new(format!("rec{i}"));
            for (j, name) in fields.split(',').map(str::trim).enumerate() {
                builder = builder.member(format!("f{j}"), types.resolve(name)?);
            }
            let record = builder.build().map_err(|err| format!("rec{i}: {err}"))?;
            types.records.push(record);
        }
        Ok(types)
    }

    fn resolve(&mut self, name: &str) -> Result<TypeRef, String> {
        if let Some(index) = name.strip_prefix("rec") {
            return index
                .parse::<usize>()
                .ok()
                .and_then(|i| self.records.get(i).cloned())
                .ok_or_else(|| format!("unknown record `{name}`"));
        }
        let kind = PrimitiveKind::from_keyword(name).ok_or_else(|| format!("unknown type `{name}`"))?;
        self.registry.primitive(kind).map_err(|err| err.to_string())
    }
}

fn describe_piece(backend: &dyn Classifier, piece: &Piece, ret: bool) -> String {
    let reg = if ret {
        backend.return_register_name(piece.dest)
    } else {
        backend.register_name(piece.dest)
    };
    let mut out = format!("{reg} <- [{}..{}]", piece.src, piece.src + piece.len);
    if piece.extend != Extend::None {
        out.push_str(&format!(" {:?}", piece.extend).to_lowercase());
    }
    if piece.width != piece.len {
        out.push_str(&format!(" to {}", piece.width));
    }
    out
}

fn print_layout(sig: &FunctionSignature, layout: &FunctionLayout) {
    let backend = classifier(layout.abi);
    println!(
        "{} on {}: forward {:?}, {} stack bytes",
        sig.name, layout.abi, layout.forward, layout.args_size
    );
    if let Some(name) = &layout.decorated_name {
        println!("  symbol {name}");
    }
    if layout.callee_pops > 0 {
        println!("  callee pops {} bytes", layout.callee_pops);
    }
    let ret = &layout.ret;
    match ret.mode {
        PassMode::Ignore => println!("  ret  {:<8} ignored", sig.ret.name()),
        PassMode::Indirect => {
            let hidden = ret
                .hidden
                .map_or_else(|| "?".to_string(), |loc| backend.register_name(loc));
            println!("  ret  {:<8} through buffer in {hidden}", sig.ret.name());
        }
        PassMode::Direct => {
            for piece in &ret.pieces {
                println!("  ret  {:<8} {}", sig.ret.name(), describe_piece(backend, piece, true));
            }
        }
    }
    for (i, (param, placement)) in sig.params.iter().zip(&layout.params).enumerate() {
        let name = param.ty.name();
        let tag = if param.variadic { "..." } else { "" };
        let by_ref = if placement.mode == PassMode::Indirect {
            " by reference"
        } else {
            ""
        };
        if placement.pieces.is_empty() {
            println!("  #{i:<3} {name:<8}{tag} ignored");
        }
        for piece in &placement.pieces {
            println!("  #{i:<3} {name:<8}{tag} {}{by_ref}", describe_piece(backend, piece, false));
        }
    }
}

fn run_classify(
    abi: Option<String>,
    conv: String,
    ret: String,
    params: Vec<String>,
    variadic_from: Option<usize>,
    records: Vec<String>,
) -> Result<(), String> {
    let abi = match abi {
        Some(name) => Abi::from_name(&name).ok_or_else(|| format!("unknown ABI `{name}`"))?,
        None => Abi::host().ok_or("the host ABI is unknown, pass --abi")?,
    };
    let conv = CallConv::from_name(&conv).ok_or_else(|| format!("unknown convention `{conv}`"))?;
    let mut types = Types::new(abi, &records)?;

    let ret = types.resolve(&ret)?;
    let fixed = variadic_from.unwrap_or(params.len()).min(params.len());
    let mut sig = FunctionSignature::new("f", ret).conv(conv);
    for name in &params[..fixed] {
        sig = sig.param(types.resolve(name)?);
    }
    if variadic_from.is_some() {
        let extra = params[fixed..]
            .iter()
            .map(|name| types.resolve(name))
            .collect::<Result<Vec<_>, _>>()?;
        sig = sig.variadic().with_variadic(&extra);
    }
    let layout: AlienResult<FunctionLayout> = classify(abi, &sig);
    let layout = layout.map_err(|err| err.to_string())?;
    print_layout(&sig, &layout);
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let result = match cli.command {
        Command::Abis => {
            let host = Abi::host();
            for abi in Abi::ALL {
                let marker = if Some(abi) == host { "  (host)" } else { "" };
                println!("{}{marker}", abi.name());
            }
            Ok(())
        }
        Command::Classify {
            abi,
            conv,
            ret,
            params,
            variadic_from,
            records,
        } => run_classify(abi, conv, ret, params, variadic_from, records),
    };

    if let Err(err) = result {
        eprintln!("Error: {err}");
        process::exit(1);
    }
}
