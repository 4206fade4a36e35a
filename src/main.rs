fn main() {
    speen_orchestrator_lib::run()
}
