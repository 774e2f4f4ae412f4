//! JSON view of the loaded modules.

use std::sync::Arc;

use serde_json::{json, Map, Value as Json};
use strand_vm::{Chunk, Constant, Instruction, Loader, Prototype};

/// Every running chunk followed by every garbage chunk.
pub fn encode_modules(loader: &Loader) -> Json {
    let running = loader.running().iter().map(|c| encode_chunk(c, "running"));
    let garbage = loader.garbages().iter().map(|c| encode_chunk(c, "garbage"));
    Json::Array(running.chain(garbage).collect())
}

fn encode_chunk(chunk: &Chunk, kind: &str) -> Json {
    json!({
        "address": chunk.id.0,
        "type": kind,
        "module": chunk.name(),
        "prototypes": chunk.module.nesteds.iter().map(encode_prototype).collect::<Vec<_>>(),
    })
}

fn encode_prototype(p: &Arc<Prototype>) -> Json {
    let mut obj = Map::new();
    obj.insert("address".into(), json!(Arc::as_ptr(p) as usize));
    if let Some(name) = &p.symbol {
        obj.insert("name".into(), json!(name));
    }
    obj.insert(
        "imports".into(),
        p.imports
            .iter()
            .map(|i| json!({ "module": i.module, "name": i.name }))
            .collect(),
    );
    obj.insert("constants".into(), p.constants.iter().map(encode_constant).collect());
    obj.insert(
        "instructions".into(),
        p.instructions.iter().map(encode_instruction).collect(),
    );
    obj.insert("prototypes".into(), p.nesteds.iter().map(encode_prototype).collect());
    Json::Object(obj)
}

fn encode_constant(c: &Constant) -> Json {
    match c {
        Constant::Integer(i) => json!(i),
        Constant::Real(r) => json!(r),
        Constant::String(s) => json!(s),
    }
}

pub fn encode_instruction(ins: &Instruction) -> Json {
    let t = ins.mnemonic();
    match *ins {
        Instruction::Pop(n) => json!({ "type": t, "n": n }),
        Instruction::Ldk(idx)
        | Instruction::Llv(idx)
        | Instruction::Slv(idx)
        | Instruction::Imp(idx)
        | Instruction::Cls(idx) => json!({ "type": t, "idx": idx }),
        Instruction::Ldb(val) => json!({ "type": t, "val": val }),
        Instruction::Lsi(val) => json!({ "type": t, "val": val }),
        Instruction::Jmp(d) | Instruction::Jin(d) | Instruction::Rcv(d) => {
            json!({ "type": t, "displacement": d })
        }
        Instruction::Ivk(nargs) => json!({ "type": t, "nargs": nargs }),
        _ => json!({ "type": t }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strand_vm::Import;

    fn module(name: &str, tag: i32) -> Prototype {
        Prototype {
            symbol: Some(name.into()),
            nesteds: vec![Arc::new(Prototype {
                symbol: Some("main".into()),
                instructions: vec![Instruction::Lsi(tag), Instruction::Ret],
                constants: vec![Constant::Integer(3), Constant::String("s".into())],
                imports: vec![Import::new("std-value", "eq")],
                nesteds: vec![Arc::new(Prototype::default())],
                ..Default::default()
            })],
            ..Default::default()
        }
    }

    #[test]
    fn test_instruction_fields() {
        assert_eq!(encode_instruction(&Instruction::Nop), json!({"type": "nop"}));
        assert_eq!(encode_instruction(&Instruction::Pop(2)), json!({"type": "pop", "n": 2}));
        assert_eq!(encode_instruction(&Instruction::Cls(1)), json!({"type": "cls", "idx": 1}));
        assert_eq!(
            encode_instruction(&Instruction::Ldb(true)),
            json!({"type": "ldb", "val": true})
        );
        assert_eq!(
            encode_instruction(&Instruction::Rcv(-4)),
            json!({"type": "rcv", "displacement": -4})
        );
        assert_eq!(encode_instruction(&Instruction::Ivk(3)), json!({"type": "ivk", "nargs": 3}));
    }

    #[test]
    fn test_running_then_garbage() {
        let mut loader = Loader::with_std().unwrap();
        loader.add_chunk(module("m", 1)).unwrap();
        loader.link().unwrap();
        loader.add_chunk(module("m", 2)).unwrap();
        loader.link().unwrap();

        let out = encode_modules(&loader);
        let chunks = out.as_array().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0]["type"], "running");
        assert_eq!(chunks[1]["type"], "garbage");
        assert_eq!(chunks[0]["module"], "m");

        let main = &chunks[0]["prototypes"][0];
        assert_eq!(main["name"], "main");
        assert_eq!(main["instructions"][0], json!({"type": "lsi", "val": 2}));
        assert_eq!(main["constants"], json!([3, "s"]));
        assert_eq!(main["imports"], json!([{"module": "std-value", "name": "eq"}]));

        let anonymous = &main["prototypes"][0];
        assert!(anonymous.get("name").is_none());
        assert!(anonymous["address"].is_u64());
    }
}
